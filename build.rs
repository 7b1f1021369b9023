use std::fs;
use std::path::Path;

/// Generates `mod` items for every detector directory plus the list of their names.
fn main() {
    println!("cargo:rerun-if-changed=src/detectors/");

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let detectors_dir = Path::new(&manifest_dir).join("src/detectors");

    let mut modules: Vec<String> = fs::read_dir(&detectors_dir)
        .expect("src/detectors/ directory not found")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("mod.rs").is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    modules.sort();

    let mut content = String::new();
    for module in &modules {
        let module_path = detectors_dir.join(module).join("mod.rs");
        content.push_str(&format!(
            "#[path = {:?}]\npub(crate) mod {};\n",
            module_path, module
        ));
    }
    content.push_str("\n#[allow(dead_code)]\npub(crate) const DETECTOR_MODULES: &[&str] = &[\n");
    for module in &modules {
        content.push_str(&format!("    {:?},\n", module));
    }
    content.push_str("];\n");

    let out_dir = std::env::var("OUT_DIR").unwrap();
    fs::write(Path::new(&out_dir).join("detector_modules.rs"), content).unwrap();
}
