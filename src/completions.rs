//! Completion scripts for the `cardmig` command tree.
//!
//! Project roots, backup directories and snapshots are directory paths, so
//! the generated scripts complete them from the filesystem.

use std::io::Write;

use clap_complete::{generate, Shell};

const BIN_NAME: &str = "cardmig";

pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut command = crate::cli::styled_command();
    generate(shell, &mut command, BIN_NAME, out);
}
