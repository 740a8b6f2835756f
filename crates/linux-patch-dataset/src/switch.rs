use crate::error::Result;
use crate::exec::ExecCtx;
use crate::kbuild::KernelBuild;
use crate::vcs::VersionControl;

/// Bring the shared kernel tree back to exactly its checked-in state, applied
/// fix patches included. Every build phase starts from here.
pub fn reset_tree(vcs: &dyn VersionControl, kernel: &dyn KernelBuild, ctx: &ExecCtx) -> Result<()> {
    // `git clean -xdf` removes whatever a failed `make clean` leaves behind.
    if let Err(e) = kernel.clean(ctx) {
        ctx.log(&format!("build clean failed, continuing: {e}"));
    }
    vcs.discard_all(ctx)
}

pub fn switch_commit(
    vcs: &dyn VersionControl,
    kernel: &dyn KernelBuild,
    ctx: &ExecCtx,
    rev: &str,
) -> Result<()> {
    reset_tree(vcs, kernel, ctx)?;
    vcs.checkout(ctx, rev)
}
