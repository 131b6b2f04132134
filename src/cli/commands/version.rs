//! Version command - show version information

use anyhow::Result;

use crate::ssh::transport::{CIPHERS, HOST_KEY_ALGORITHMS, KEX_ALGORITHMS};

/// Execute the version command
pub async fn execute(verbose: bool) -> Result<()> {
    print_version(verbose);
    Ok(())
}

/// Print version information
///
/// If verbose is false, prints a single line with name and version.
/// If verbose is true, prints supported protocols and build information.
pub fn print_version(verbose: bool) {
    println!("{} {}", crate::NAME, crate::VERSION);

    if verbose {
        println!();
        println!("Protocols:");
        println!("  - HTTP/1.1 proxy (CONNECT and absolute-URI requests, Basic auth)");
        println!("  - SOCKS5 (CONNECT, username/password auth)");
        println!("  - SSH tunnel (direct-tcpip, password auth)");
        println!("  - Upstream chaining via HTTP, SOCKS5 or SSH");
        println!();
        println!("SSH algorithms:");
        println!("  kex:       {}", KEX_ALGORITHMS.join(", "));
        println!("  host key:  {}", HOST_KEY_ALGORITHMS.join(", "));
        println!("  cipher:    {}", CIPHERS.join(", "));
        println!();
        println!("Build info:");
        println!("  Target:    {}", env!("BUILD_TARGET"));
        println!("  Profile:   {}", env!("BUILD_PROFILE"));
        println!("  Rust:      {}", env!("RUSTC_VERSION"));
        if let Ok(exe) = std::env::current_exe() {
            println!("  Executable: {}", exe.display());
        }
    }
}
