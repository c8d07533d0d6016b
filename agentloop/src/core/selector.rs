//! Deterministic model selection with fallback.

use crate::core::types::ModelConfig;

/// Ordered cursor over the configured models.
///
/// In primary mode every model is a candidate, in priority order (ties keep the
/// configured order). In fallback mode only models flagged `fallback` are drawn.
/// The cursor only moves on [`ModelSelector::get_next`].
#[derive(Debug, Clone)]
pub struct ModelSelector {
    models: Vec<ModelConfig>,
    cursor: usize,
    using_fallback: bool,
}

impl ModelSelector {
    pub fn new(mut models: Vec<ModelConfig>) -> Self {
        models.sort_by_key(|model| model.priority);
        Self {
            models,
            cursor: 0,
            using_fallback: false,
        }
    }

    /// Next candidate in priority order, or `None` once the active ordering is exhausted.
    pub fn get_next(&mut self) -> Option<&ModelConfig> {
        let using_fallback = self.using_fallback;
        let model = self
            .models
            .iter()
            .filter(|model| !using_fallback || model.fallback)
            .nth(self.cursor)?;
        self.cursor += 1;
        Some(model)
    }

    /// Restrict subsequent draws to the fallback subset, starting from its head.
    pub fn switch_to_fallback(&mut self) {
        self.using_fallback = true;
        self.cursor = 0;
    }

    /// Leave fallback mode and rewind to the head of the primary ordering.
    pub fn reset_fallback(&mut self) {
        self.using_fallback = false;
        self.cursor = 0;
    }

    /// Restore the initial state.
    pub fn reset(&mut self) {
        self.reset_fallback();
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn all_models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub fn total_model_count(&self) -> usize {
        self.models.len()
    }
}

/// Failure-driven rotation policy over a [`ModelSelector`].
///
/// Holds the active model. After `fallback_after_failures` consecutive failures the
/// selector switches to the fallback subset; further failures advance within the
/// active ordering and wrap back to the primary head once it is exhausted.
#[derive(Debug, Clone)]
pub struct ModelRotation {
    selector: ModelSelector,
    fallback_after_failures: u32,
    consecutive_failures: u32,
    active: Option<ModelConfig>,
}

impl ModelRotation {
    pub fn new(models: Vec<ModelConfig>, fallback_after_failures: u32) -> Self {
        let mut selector = ModelSelector::new(models);
        let active = selector.get_next().cloned();
        Self {
            selector,
            fallback_after_failures: fallback_after_failures.max(1),
            consecutive_failures: 0,
            active,
        }
    }

    /// Model for the next attempt; `None` when no models are configured.
    pub fn active(&self) -> Option<&ModelConfig> {
        self.active.as_ref()
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failed attempt and return the model to use next.
    pub fn record_failure(&mut self) -> Option<&ModelConfig> {
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.fallback_after_failures {
            return self.active.as_ref();
        }
        self.consecutive_failures = 0;
        if !self.selector.is_using_fallback() {
            self.selector.switch_to_fallback();
        }
        let next = match self.selector.get_next() {
            Some(model) => Some(model.clone()),
            None => {
                self.selector.reset();
                self.selector.get_next().cloned()
            }
        };
        // An empty fallback subset keeps the current model.
        if next.is_some() {
            self.active = next;
        }
        self.active.as_ref()
    }

    /// Back to the primary head with a clean failure count.
    pub fn reset(&mut self) {
        self.selector.reset();
        self.consecutive_failures = 0;
        self.active = self.selector.get_next().cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, priority: u32, fallback: bool) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            priority,
            fallback,
        }
    }

    fn models() -> Vec<ModelConfig> {
        vec![
            model("cheap", 3, true),
            model("best", 1, false),
            model("good", 2, true),
        ]
    }

    fn drain(selector: &mut ModelSelector) -> Vec<String> {
        std::iter::from_fn(|| selector.get_next().map(|m| m.name.clone())).collect()
    }

    #[test]
    fn get_next_walks_priority_order_then_exhausts() {
        let mut selector = ModelSelector::new(models());
        assert_eq!(drain(&mut selector), vec!["best", "good", "cheap"]);
        assert!(selector.get_next().is_none());
    }

    #[test]
    fn fallback_mode_draws_only_fallback_models() {
        let mut selector = ModelSelector::new(models());
        selector.get_next();
        selector.switch_to_fallback();
        assert!(selector.is_using_fallback());
        assert_eq!(drain(&mut selector), vec!["good", "cheap"]);
    }

    #[test]
    fn reset_restores_primary_ordering() {
        let mut selector = ModelSelector::new(models());
        selector.switch_to_fallback();
        selector.get_next();
        selector.reset_fallback();
        assert!(!selector.is_using_fallback());
        assert_eq!(selector.get_next().map(|m| m.name.as_str()), Some("best"));
        selector.reset();
        assert_eq!(selector.get_next().map(|m| m.name.as_str()), Some("best"));
    }

    #[test]
    fn queries_do_not_move_cursor() {
        let mut selector = ModelSelector::new(models());
        assert_eq!(selector.total_model_count(), 3);
        assert_eq!(selector.all_models()[0].name, "best");
        assert_eq!(selector.get_next().map(|m| m.name.as_str()), Some("best"));
    }

    #[test]
    fn rotation_switches_to_fallback_after_threshold() {
        let mut rotation = ModelRotation::new(models(), 2);
        assert_eq!(rotation.active().map(|m| m.name.as_str()), Some("best"));

        assert_eq!(
            rotation.record_failure().map(|m| m.name.as_str()),
            Some("best")
        );
        assert_eq!(
            rotation.record_failure().map(|m| m.name.as_str()),
            Some("good")
        );
        assert!(rotation.selector().is_using_fallback());
    }

    #[test]
    fn rotation_success_clears_failure_count() {
        let mut rotation = ModelRotation::new(models(), 2);
        rotation.record_failure();
        rotation.record_success();
        assert_eq!(rotation.consecutive_failures(), 0);
        assert_eq!(
            rotation.record_failure().map(|m| m.name.as_str()),
            Some("best")
        );
    }

    #[test]
    fn rotation_wraps_to_primary_when_fallback_exhausted() {
        let mut rotation = ModelRotation::new(models(), 1);
        let seen: Vec<String> = (0..4)
            .filter_map(|_| rotation.record_failure().map(|m| m.name.clone()))
            .collect();
        assert_eq!(seen, vec!["good", "cheap", "best", "good"]);
    }

    #[test]
    fn rotation_without_models_has_no_active() {
        let mut rotation = ModelRotation::new(Vec::new(), 1);
        assert!(rotation.active().is_none());
        assert!(rotation.record_failure().is_none());
    }
}
