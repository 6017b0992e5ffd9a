// Scaling policy - one decision per class per tick
use crate::config::{ClassConfig, ControllerConfig};

/// Scaling decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add one consumer
    ScaleUp,
    /// Retire one consumer (most recently added)
    ScaleDown,
    Hold,
}

/// What the loop observed for one class this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassObservation {
    pub backlog_depth: u64,
    pub consumers: usize,
    /// Consecutive ticks with an empty queue, this one included
    pub empty_ticks: u32,
}

/// Backlog-driven policy
///
/// - depth > high_watermark, below max and under the global cap: ScaleUp
/// - depth == 0, above min and empty for `scale_down_after_empty_ticks`
///   ticks: ScaleDown
/// - otherwise Hold
///
/// Classes are evaluated highest rank first, so a global cap is consumed
/// by the most urgent class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    scale_down_after_empty_ticks: u32,
    max_total_consumers: Option<usize>,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            scale_down_after_empty_ticks: 1,
            max_total_consumers: None,
        }
    }
}

impl ScalingPolicy {
    pub fn new(scale_down_after_empty_ticks: u32, max_total_consumers: Option<usize>) -> Self {
        Self {
            scale_down_after_empty_ticks: scale_down_after_empty_ticks.max(1),
            max_total_consumers,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.scale_down_after_empty_ticks, config.max_total_consumers)
    }

    /// `total_consumers` is the active count across all classes right now
    pub fn decide(
        &self,
        class: &ClassConfig,
        observed: ClassObservation,
        total_consumers: usize,
    ) -> ScaleDecision {
        if observed.backlog_depth > class.high_watermark && observed.consumers < class.max_consumers {
            if self
                .max_total_consumers
                .is_some_and(|cap| total_consumers >= cap)
            {
                return ScaleDecision::Hold;
            }
            return ScaleDecision::ScaleUp;
        }

        if observed.backlog_depth == 0
            && observed.consumers > class.min_consumers
            && observed.empty_ticks >= self.scale_down_after_empty_ticks
        {
            return ScaleDecision::ScaleDown;
        }

        ScaleDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueClass;

    fn priority() -> ClassConfig {
        ClassConfig::new(&QueueClass::priority(), 1, 3, 1, 10)
    }

    fn seen(depth: u64, consumers: usize, empty_ticks: u32) -> ClassObservation {
        ClassObservation {
            backlog_depth: depth,
            consumers,
            empty_ticks,
        }
    }

    #[test]
    fn backlog_above_watermark_scales_up_until_max() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.decide(&priority(), seen(15, 1, 0), 3), ScaleDecision::ScaleUp);
        assert_eq!(policy.decide(&priority(), seen(15, 3, 0), 5), ScaleDecision::Hold);
    }

    #[test]
    fn depth_at_watermark_holds() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.decide(&priority(), seen(10, 1, 0), 3), ScaleDecision::Hold);
    }

    #[test]
    fn empty_queue_scales_down_until_min() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.decide(&priority(), seen(0, 3, 1), 5), ScaleDecision::ScaleDown);
        assert_eq!(policy.decide(&priority(), seen(0, 1, 1), 3), ScaleDecision::Hold);
    }

    #[test]
    fn small_backlog_holds() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.decide(&priority(), seen(4, 2, 0), 4), ScaleDecision::Hold);
    }

    #[test]
    fn hysteresis_delays_scale_down() {
        let policy = ScalingPolicy::new(3, None);
        assert_eq!(policy.decide(&priority(), seen(0, 3, 2), 5), ScaleDecision::Hold);
        assert_eq!(policy.decide(&priority(), seen(0, 3, 3), 5), ScaleDecision::ScaleDown);
    }

    #[test]
    fn global_cap_blocks_scale_up() {
        let policy = ScalingPolicy::new(1, Some(4));
        assert_eq!(policy.decide(&priority(), seen(50, 1, 0), 4), ScaleDecision::Hold);
        assert_eq!(policy.decide(&priority(), seen(50, 1, 0), 3), ScaleDecision::ScaleUp);
    }
}
