/// Decides whether [`crate::Allocator::resize`] can keep a pointer when the
/// new size is different from the current one. Growing always moves, since
/// none of the sub-allocators can extend a region in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Move whenever the logical size changes. Every pointer always reports
    /// the size class of its last request.
    #[default]
    Exact,
    /// Keep the pointer when shrinking to more than half of the current
    /// logical size. Saves a copy at the cost of some slack.
    HalfShrink,
}

impl ResizePolicy {
    /// Whether a region with `current` logical bytes can serve a resize to
    /// `requested` bytes without moving.
    pub fn keeps_in_place(self, current: usize, requested: usize) -> bool {
        if requested == current {
            return true;
        }

        match self {
            Self::Exact => false,
            Self::HalfShrink => requested < current && requested > current / 2,
        }
    }
}
