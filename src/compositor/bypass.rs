//! Composition bypass
//!
//! When the topmost thing covering an output is one opaque, unshaped,
//! untransformed window that exactly fills it, its buffer can be scanned out
//! directly and composition skipped for that output.

use crate::geometry::Rectangle;
use cgmath::{Matrix4, SquareMatrix};

/// Properties of a renderable that decide whether it can be bypassed
pub trait CompositingCriteria {
    fn screen_position(&self) -> Rectangle;
    fn alpha(&self) -> f32;
    fn shaped(&self) -> bool;
    fn transformation(&self) -> Matrix4<f32>;
}

/// Running predicate over renderables for one output, fed bottom to top.
/// After the last renderable, [`BypassMatch::topmost_fullscreen`] tells
/// whether the topmost one overlapping the output can be bypassed.
#[derive(Debug, Clone)]
pub struct BypassMatch {
    view_area: Rectangle,
    topmost_fits: bool,
}

impl BypassMatch {
    pub fn new(view_area: Rectangle) -> Self {
        Self {
            view_area,
            topmost_fits: false,
        }
    }

    /// Feeds the next renderable up the stack. Returns whether it is a
    /// bypass candidate. Renderables off this output leave the state alone.
    pub fn accept<C: CompositingCriteria + ?Sized>(&mut self, renderable: &C) -> bool {
        if !renderable.screen_position().overlaps(&self.view_area) {
            return false;
        }

        self.topmost_fits = self.fits(renderable);
        self.topmost_fits
    }

    pub fn topmost_fullscreen(&self) -> bool {
        self.topmost_fits
    }

    fn fits<C: CompositingCriteria + ?Sized>(&self, renderable: &C) -> bool {
        renderable.alpha() >= 1.0
            && !renderable.shaped()
            && renderable.transformation() == Matrix4::identity()
            && renderable.screen_position() == self.view_area
    }

    /// Index of the bypass candidate in a bottom-to-top list, if the topmost
    /// renderable overlapping `view_area` qualifies
    pub fn find<C: CompositingCriteria>(view_area: Rectangle, renderables: &[C]) -> Option<usize> {
        let matcher = Self::new(view_area);
        renderables
            .iter()
            .enumerate()
            .rev()
            .find(|(_, r)| r.screen_position().overlaps(&view_area))
            .filter(|(_, r)| matcher.fits(*r))
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    const OUTPUT: Rectangle = Rectangle::new(0, 0, 1920, 1200);

    struct Window {
        position: Rectangle,
        alpha: f32,
        shaped: bool,
        transformation: Matrix4<f32>,
    }

    impl Window {
        fn at(position: Rectangle) -> Self {
            Self {
                position,
                alpha: 1.0,
                shaped: false,
                transformation: Matrix4::identity(),
            }
        }

        fn fullscreen() -> Self {
            Self::at(OUTPUT)
        }
    }

    impl CompositingCriteria for Window {
        fn screen_position(&self) -> Rectangle {
            self.position
        }

        fn alpha(&self) -> f32 {
            self.alpha
        }

        fn shaped(&self) -> bool {
            self.shaped
        }

        fn transformation(&self) -> Matrix4<f32> {
            self.transformation
        }
    }

    fn evaluate(windows: &[Window]) -> bool {
        let mut matcher = BypassMatch::new(OUTPUT);
        for window in windows {
            matcher.accept(window);
        }
        let result = matcher.topmost_fullscreen();
        assert_eq!(result, BypassMatch::find(OUTPUT, windows).is_some());
        result
    }

    #[test]
    fn test_nothing_to_bypass() {
        assert!(!evaluate(&[]));
    }

    #[test]
    fn test_opaque_window_covering_1080p_output() {
        let view = Rectangle::new(0, 0, 1920, 1080);
        let opaque = Window::at(view);
        let faded = Window {
            alpha: 0.5,
            ..Window::at(view)
        };

        assert_eq!(BypassMatch::find(view, &[opaque]), Some(0));
        assert_eq!(BypassMatch::find(view, &[faded]), None);
    }

    #[test]
    fn test_small_window_not_bypassed() {
        assert!(!evaluate(&[Window::at(Rectangle::new(10, 10, 100, 100))]));
    }

    #[test]
    fn test_single_fullscreen_window_bypassed() {
        assert!(evaluate(&[Window::fullscreen()]));
        assert_eq!(BypassMatch::find(OUTPUT, &[Window::fullscreen()]), Some(0));
    }

    #[test]
    fn test_translucent_fullscreen_window_not_bypassed() {
        let mut window = Window::fullscreen();
        window.alpha = 0.5;
        assert!(!evaluate(&[window]));
    }

    #[test]
    fn test_shaped_fullscreen_window_not_bypassed() {
        let mut window = Window::fullscreen();
        window.shaped = true;
        assert!(!evaluate(&[window]));
    }

    #[test]
    fn test_transformed_fullscreen_window_not_bypassed() {
        let mut window = Window::fullscreen();
        window.transformation = Matrix4::from_nonuniform_scale(1.0, 0.5, 1.0);
        assert!(!evaluate(&[window]));

        let mut shifted = Window::fullscreen();
        shifted.transformation = Matrix4::from_translation(Vector3::new(4.0, 0.0, 0.0));
        assert!(!evaluate(&[shifted]));
    }

    #[test]
    fn test_offset_fullscreen_window_not_bypassed() {
        assert!(!evaluate(&[Window::at(Rectangle::new(1, 0, 1920, 1200))]));
        assert!(!evaluate(&[Window::at(Rectangle::new(0, 0, 1921, 1200))]));
    }

    #[test]
    fn test_topmost_fullscreen_window_wins() {
        let windows = [
            Window::at(Rectangle::new(10, 10, 100, 100)),
            Window::fullscreen(),
        ];
        assert!(evaluate(&windows));
        assert_eq!(BypassMatch::find(OUTPUT, &windows), Some(1));
    }

    #[test]
    fn test_small_window_on_top_prevents_bypass() {
        assert!(!evaluate(&[
            Window::fullscreen(),
            Window::at(Rectangle::new(10, 10, 100, 100)),
        ]));
    }

    #[test]
    fn test_transparent_window_on_top_prevents_bypass() {
        let mut overlay = Window::fullscreen();
        overlay.alpha = 0.0;
        assert!(!evaluate(&[Window::fullscreen(), overlay]));
    }

    #[test]
    fn test_windows_on_other_outputs_are_ignored() {
        assert!(evaluate(&[
            Window::fullscreen(),
            Window::at(Rectangle::new(1920, 0, 1920, 1200)),
        ]));
    }
}
