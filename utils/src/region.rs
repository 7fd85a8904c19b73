// Region tracking helpers

/// A rectangular region
///
/// This can be used to track scissor regions,
/// copy rectangles, etc. It is determined by
/// the corners of a rectangle:
///   r_pos:  the upper left corner's position
///   r_size: the distance from the left to the lower right
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Rect<T> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }
}
