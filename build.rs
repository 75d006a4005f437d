// Stamps the short git hash into AUTOEDIT_GIT_HASH for `autoedit --version`.
// Builds outside a checkout report "unknown".
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    let hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_owned())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_owned());
    println!("cargo:rustc-env=AUTOEDIT_GIT_HASH={hash}");
}
