/// Where the viewer is relative to the live edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewState {
    #[default]
    Initial,
    LiveAtEdge,
    LiveScrolled,
    Historical,
}

impl ViewState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::LiveAtEdge => "live",
            Self::LiveScrolled => "live-scrolled",
            Self::Historical => "historical",
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::LiveAtEdge | Self::LiveScrolled)
    }
}

/// Scroll position of the rendering viewport, in renderer units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn new(scroll_top: f64, scroll_height: f64, client_height: f64) -> Self {
        Self { scroll_top, scroll_height, client_height }
    }

    pub fn top(scroll_height: f64, client_height: f64) -> Self {
        Self::new(0.0, scroll_height, client_height)
    }

    /// Position at `ratio` of the scrollable range (0 = top, 1 = bottom).
    pub fn at_ratio(ratio: f64, scroll_height: f64, client_height: f64) -> Self {
        let range = (scroll_height - client_height).max(0.0);
        Self::new(range * ratio.clamp(0.0, 1.0), scroll_height, client_height)
    }

    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    pub fn is_at_top(&self) -> bool {
        self.scroll_top <= 0.0
    }

    pub fn is_near_bottom(&self, threshold: f64) -> bool {
        self.distance_from_bottom() < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.40, false)]
    #[case(0.95, true)]
    #[case(1.0, true)]
    fn near_bottom_uses_threshold(#[case] ratio: f64, #[case] expected: bool) {
        let metrics = ScrollMetrics::at_ratio(ratio, 2_050.0, 600.0);
        assert_eq!(metrics.is_near_bottom(200.0), expected);
    }

    #[test]
    fn short_content_is_both_top_and_bottom() {
        let metrics = ScrollMetrics::top(300.0, 600.0);
        assert!(metrics.is_at_top());
        assert!(metrics.is_near_bottom(200.0));
        assert_eq!(metrics.distance_from_bottom(), 0.0);
    }

    #[test]
    fn live_states() {
        assert!(ViewState::LiveAtEdge.is_live());
        assert!(ViewState::LiveScrolled.is_live());
        assert!(!ViewState::Historical.is_live());
        assert_eq!(ViewState::default(), ViewState::Initial);
    }
}
