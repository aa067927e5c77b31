use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let build_time = chrono::Utc::now().to_rfc3339();
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);

    let git_hash = env::var("GIT_HASH").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
}
