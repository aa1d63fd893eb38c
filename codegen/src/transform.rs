//! Driver for listing-to-listing rewrite passes.
//!
//! A pass sees the source listing one line at a time and appends whatever
//! it likes to the destination. The destination shares the source's block
//! and variable tables, and labels attached to a source line are re-marked
//! before the first instruction the pass emits for that line, so control
//! flow survives arbitrary expansion of a line into many instructions.

use crate::listing::Listing;
use crate::result::CodegenResult;
use log::trace;

pub trait Transform {
    /// Called once before any line is processed.
    fn before(&mut self, _dest: &mut Listing, _src: &Listing) -> CodegenResult<()> {
        Ok(())
    }

    /// Rewrite one line of `src` into `dest`.
    fn during(&mut self, dest: &mut Listing, src: &Listing, line: usize) -> CodegenResult<()>;

    /// Called once after the last line, before trailing labels are fixed
    /// up. Data tables emitted here land after all code.
    fn after(&mut self, _dest: &mut Listing, _src: &Listing) -> CodegenResult<()> {
        Ok(())
    }

    /// Name used in trace logging.
    fn name(&self) -> &'static str;
}

pub fn transform(src: &Listing, t: &mut dyn Transform) -> CodegenResult<Listing> {
    trace!("running {} over {} instructions", t.name(), src.count());

    let mut dest = src.clone_shell();
    t.before(&mut dest, src)?;

    for line in 0..src.count() {
        for &l in src.labels_at(line) {
            dest.mark(l);
        }
        t.during(&mut dest, src, line)?;
    }

    // The virtual labels at the end of the code.
    for &l in src.labels_at(src.count()) {
        dest.mark(l);
    }

    t.after(&mut dest, src)?;
    Ok(dest)
}
