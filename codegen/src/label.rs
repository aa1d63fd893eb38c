//! Labels name positions in a listing.
//!
//! A label is an opaque id handed out by the listing it belongs to. It
//! resolves to a byte offset only after the first (sizing) output pass.

/// A position in a listing, attached *before* the instruction it marks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Label(pub(crate) u32);

impl Label {
    pub fn key(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}
