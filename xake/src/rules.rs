// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Rule bindings and target lookup
//!
//! A rule binds a target shape to the recipe that produces it. The set
//! is ordered and lookup is strictly first-match, which lets narrow
//! bindings shadow broad ones simply by being declared earlier.

use std::{fmt, future::Future, path::Path, sync::Arc};

use crate::recipe::{self, Recipe, TaskContext};
use crate::target::Target;

/// One pattern → recipe binding
pub enum Rule {
    /// Matches file targets by glob, relative to the project root
    Pattern { pattern: fileset::Pattern, recipe: Recipe },
    /// Matches file targets by arbitrary predicate over the absolute path
    Predicate {
        check: Arc<dyn Fn(&Path) -> bool + Send + Sync>,
        recipe: Recipe,
    },
    /// Matches the phony target of the same name
    Phony { name: String, recipe: Recipe },
}

impl Rule {
    pub fn pattern<F, Fut>(glob: &str, recipe: F) -> Result<Self, fileset::Error>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), recipe::Error>> + Send + 'static,
    {
        Ok(Self::Pattern {
            pattern: fileset::Pattern::new(glob)?,
            recipe: Recipe::new(recipe),
        })
    }

    pub fn predicate<P, F, Fut>(check: P, recipe: F) -> Self
    where
        P: Fn(&Path) -> bool + Send + Sync + 'static,
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), recipe::Error>> + Send + 'static,
    {
        Self::Predicate {
            check: Arc::new(check),
            recipe: Recipe::new(recipe),
        }
    }

    pub fn phony<F, Fut>(name: impl ToString, recipe: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), recipe::Error>> + Send + 'static,
    {
        Self::Phony {
            name: name.to_string(),
            recipe: Recipe::new(recipe),
        }
    }

    /// A phony rule that demands the given targets and always reruns,
    /// the usual shape of aggregate goals like `main` or `all`.
    pub fn demands<S: ToString>(name: impl ToString, targets: impl IntoIterator<Item = S>) -> Self {
        let targets: Vec<String> = targets.into_iter().map(|t| t.to_string()).collect();

        Self::phony(name, move |ctx| {
            let targets = targets.clone();
            async move {
                ctx.need(&targets).await?;
                ctx.always_rerun();
                Ok(())
            }
        })
    }

    pub fn recipe(&self) -> &Recipe {
        match self {
            Rule::Pattern { recipe, .. } | Rule::Predicate { recipe, .. } | Rule::Phony { recipe, .. } => recipe,
        }
    }

    fn matches(&self, target: &Target, root: &Path) -> bool {
        match (self, target) {
            (Rule::Phony { name, .. }, Target::Phony(wanted)) => name == wanted,
            (Rule::Predicate { check, .. }, Target::File(artifact)) => check(artifact.path()),
            (Rule::Pattern { pattern, .. }, Target::File(artifact)) => {
                pattern.matches(root, artifact.path())
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Pattern { pattern, .. } => write!(f, "Pattern({pattern})"),
            Rule::Predicate { .. } => write!(f, "Predicate(..)"),
            Rule::Phony { name, .. } => write!(f, "Phony({name})"),
        }
    }
}

/// Ordered rule collection, fixed once a build starts
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// First rule matching `target`, in declaration order
    pub fn locate(&self, target: &Target, root: &Path) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(target, root))
    }

    /// Is `name` bound as a phony target? Phony bindings shadow
    /// like-named files during target resolution.
    pub(crate) fn is_phony(&self, name: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| matches!(rule, Rule::Phony { name: bound, .. } if bound == name))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::target::Artifact;

    fn noop() -> impl Fn(TaskContext) -> std::future::Ready<Result<(), recipe::Error>> + Send + Sync + 'static
    {
        |_ctx| std::future::ready(Ok(()))
    }

    fn file(root: &Path, name: &str) -> Target {
        Target::File(Artifact::resolve(root, name))
    }

    #[test]
    fn first_match_wins() {
        let root = Path::new("/project");
        let mut rules = RuleSet::new();
        rules.add(Rule::pattern("out/special.txt", noop()).unwrap());
        rules.add(Rule::pattern("out/*.txt", noop()).unwrap());

        let rule = rules.locate(&file(root, "out/special.txt"), root);
        assert!(matches!(
            rule,
            Some(Rule::Pattern { pattern, .. }) if pattern.as_str() == "out/special.txt"
        ));

        let rule = rules.locate(&file(root, "out/other.txt"), root);
        assert!(matches!(
            rule,
            Some(Rule::Pattern { pattern, .. }) if pattern.as_str() == "out/*.txt"
        ));
    }

    #[test]
    fn predicate_rules_see_absolute_paths() {
        let root = Path::new("/project");
        let mut rules = RuleSet::new();
        rules.add(Rule::predicate(
            |path: &Path| path.extension().is_some_and(|e| e == "gen"),
            noop(),
        ));

        assert!(rules.locate(&file(root, "deep/dir/a.gen"), root).is_some());
        assert!(rules.locate(&file(root, "a.txt"), root).is_none());
    }

    #[test]
    fn phony_rules_only_match_phony_targets() {
        let root = Path::new("/project");
        let mut rules = RuleSet::new();
        rules.add(Rule::phony("clean", noop()));

        assert!(rules.locate(&Target::Phony("clean".into()), root).is_some());
        assert!(rules.locate(&file(root, "clean"), root).is_none());
        assert!(rules.is_phony("clean"));
        assert!(!rules.is_phony("build"));
    }
}
