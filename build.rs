//! Generates the `caravel.1` man page from the clap definitions.

use std::env;
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR").ok_or("OUT_DIR was not set")?;
    render_man_page(Path::new(&out_dir))
}

fn render_man_page(out_dir: &Path) -> Result<(), Box<dyn Error>> {
    let mut rendered = Vec::new();
    Man::new(cli::Cli::command()).render(&mut rendered)?;
    fs::write(out_dir.join("caravel.1"), rendered)?;
    Ok(())
}
