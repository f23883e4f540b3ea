//! Integer geometry shared by buffers, outputs and renderables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in output (screen) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rectangle {
    pub top_left: Point,
    pub size: Size,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            top_left: Point::new(x, y),
            size: Size::new(width, height),
        }
    }

    /// Rectangle of the given size anchored at the origin
    pub const fn from_size(size: Size) -> Self {
        Self {
            top_left: Point::new(0, 0),
            size,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        self.top_left.x as i64 + self.size.width as i64
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        self.top_left.y as i64 + self.size.height as i64
    }

    /// True when the two rectangles share at least one pixel
    pub fn overlaps(&self, other: &Rectangle) -> bool {
        if self.size.is_empty() || other.size.is_empty() {
            return false;
        }

        (self.top_left.x as i64) < other.right()
            && (other.top_left.x as i64) < self.right()
            && (self.top_left.y as i64) < other.bottom()
            && (other.top_left.y as i64) < self.bottom()
    }

    pub fn contains(&self, other: &Rectangle) -> bool {
        self.top_left.x <= other.top_left.x
            && self.top_left.y <= other.top_left.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@({},{})", self.size, self.top_left.x, self.top_left.y)
    }
}
