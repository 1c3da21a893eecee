// build.rs

use chrono::Utc;
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let out_dir = env::var("OUT_DIR").expect("cargo sets OUT_DIR for build scripts");
    let dest_path = Path::new(&out_dir).join("build_info.rs");

    let build_date = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    // consumed by main.rs via include!()
    let contents = format!(
        "pub const BUILD_DATE: &str = \"{build_date}\";\npub const BUILD_PROFILE: &str = \"{profile}\";\n"
    );
    fs::write(&dest_path, contents).expect("unable to write build_info.rs");

    println!("cargo:rerun-if-changed=build.rs");
}
