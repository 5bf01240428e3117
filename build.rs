use std::env;

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=GLSLANG_VALIDATOR");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    compile_shaders();
}

fn compile_shaders() {
    use std::path::{Path, PathBuf};
    use std::process::Command;

    let glslang = env::var("GLSLANG_VALIDATOR").unwrap_or_else(|_| {
        match env::var("VULKAN_SDK") {
            Ok(sdk) => format!("{}/bin/glslangValidator", sdk),
            Err(_) => "glslangValidator".to_string(),
        }
    });

    let Ok(out_dir) = env::var("OUT_DIR").map(PathBuf::from) else {
        println!("cargo:warning=OUT_DIR not set. Skipping shader compilation.");
        return;
    };

    // Shaders to compile: (source_file, env_var_name, output_name)
    let shaders = [(
        "shaders/double_elements.comp",
        "DOUBLE_ELEMENTS_SPV",
        "double_elements",
    )];

    for (src_file, env_name, output_name) in &shaders {
        if !Path::new(src_file).exists() {
            println!("cargo:warning=Shader source not found: {}", src_file);
            continue;
        }

        let spv_path = out_dir.join(format!("{}.spv", output_name));

        let status = Command::new(&glslang)
            .arg("-V")
            .arg("--target-env")
            .arg("vulkan1.1")
            .arg(src_file)
            .arg("-o")
            .arg(&spv_path)
            .status();

        match status {
            Ok(status_code) if status_code.success() => {
                println!("cargo:rustc-env={}={}", env_name, spv_path.display());
            }
            Ok(status_code) => {
                println!(
                    "cargo:warning=Failed to compile {}: exit code {:?}",
                    src_file,
                    status_code.code()
                );
            }
            Err(e) => {
                println!(
                    "cargo:warning=glslangValidator unavailable for {}: {}. Using shaders/{}.spv at run time.",
                    src_file, e, output_name
                );
            }
        }
    }
}
