use std::process::Command;

/// Run a command and return its trimmed stdout, or `fallback` when it cannot run.
fn command_output(program: &str, args: &[&str], fallback: &str) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn main() {
    let build_date = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();
    println!("cargo:rustc-env=LANGCTX_BUILD_DATE={build_date}");

    let git_commit = command_output("git", &["rev-parse", "--short", "HEAD"], "unknown");
    println!("cargo:rustc-env=LANGCTX_GIT_COMMIT={git_commit}");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = command_output(&rustc, &["--version"], "unknown rustc");
    println!("cargo:rustc-env=LANGCTX_RUST_VERSION={rustc_version}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=Cargo.toml");
}
