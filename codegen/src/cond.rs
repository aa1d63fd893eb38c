//! Condition flags for conditional jumps and `set_cond`.

use std::fmt;

/// A condition for a conditional jump or set.
///
/// The `F*` variants compare floating-point values and treat unordered
/// results as false, matching the semantics of an ordered compare followed
/// by the corresponding unsigned branch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CondFlag {
    Always,
    Never,
    Overflow,
    NoOverflow,
    Equal,
    NotEqual,
    // Unsigned comparisons.
    Below,
    BelowEqual,
    AboveEqual,
    Above,
    // Signed comparisons.
    Less,
    LessEqual,
    GreaterEqual,
    Greater,
    // Floating-point comparisons.
    FBelow,
    FBelowEqual,
    FAboveEqual,
    FAbove,
}

impl CondFlag {
    /// The condition that holds exactly when `self` does not.
    pub fn inverse(self) -> CondFlag {
        use CondFlag::*;
        match self {
            Always => Never,
            Never => Always,
            Overflow => NoOverflow,
            NoOverflow => Overflow,
            Equal => NotEqual,
            NotEqual => Equal,
            Below => AboveEqual,
            BelowEqual => Above,
            AboveEqual => Below,
            Above => BelowEqual,
            Less => GreaterEqual,
            LessEqual => Greater,
            GreaterEqual => Less,
            Greater => LessEqual,
            FBelow => FAboveEqual,
            FBelowEqual => FAbove,
            FAboveEqual => FBelow,
            FAbove => FBelowEqual,
        }
    }
}

impl fmt::Display for CondFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CondFlag::*;
        let name = match self {
            Always => "always",
            Never => "never",
            Overflow => "overflow",
            NoOverflow => "no overflow",
            Equal => "==",
            NotEqual => "!=",
            Below => "<(u)",
            BelowEqual => "<=(u)",
            AboveEqual => ">=(u)",
            Above => ">(u)",
            Less => "<",
            LessEqual => "<=",
            GreaterEqual => ">=",
            Greater => ">",
            FBelow => "<(f)",
            FBelowEqual => "<=(f)",
            FAboveEqual => ">=(f)",
            FAbove => ">(f)",
        };
        f.write_str(name)
    }
}
