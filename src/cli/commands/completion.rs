//! Completion command - print a static completion script
//!
//! `COMPLETE=<shell> authproxy` gives dynamic completions instead; see
//! `main`.

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io::{self, Write};

use crate::cli::Cli;
use crate::cli::args::CompletionArgs;

/// Execute the completion command
pub async fn execute(args: CompletionArgs) -> Result<()> {
    write_script(args.shell, &mut io::stdout().lock())?;
    Ok(())
}

fn write_script(shell: Shell, out: &mut dyn Write) -> io::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
    out.flush()
}
