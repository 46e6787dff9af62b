#![deny(clippy::implicit_return)]
#![allow(clippy::needless_return)]

use anyhow::Result;
use vergen::EmitBuilder;

fn main() -> Result<()> {
    // Falls back to the package version when built outside of a git checkout.
    EmitBuilder::builder()
        .git_describe(true, true, None)
        .fail_on_error()
        .emit()
        .or_else(|_| {
            println!(
                "cargo:rustc-env=VERGEN_GIT_DESCRIBE={}",
                env!("CARGO_PKG_VERSION")
            );
            return Ok::<(), anyhow::Error>(());
        })?;

    return Ok(());
}
