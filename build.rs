fn main() {
    println!("cargo:rerun-if-changed=shaders");

    #[cfg(feature = "shader_compilation")]
    if let Err(e) = shaders::compile_all() {
        panic!("shader compilation failed: {e}");
    }
}

#[cfg(feature = "shader_compilation")]
mod shaders {
    use std::error::Error;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Compiles every `.vert` and `.frag` under `shaders/` into
    /// `$OUT_DIR/<name>.spv`.
    pub fn compile_all() -> Result<(), Box<dyn Error>> {
        let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
        let shader_dir = Path::new("shaders");
        if !shader_dir.exists() {
            return Ok(());
        }

        let compiler = shaderc::Compiler::new().ok_or("shaderc compiler unavailable")?;

        for entry in fs::read_dir(shader_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let kind = match path.extension().and_then(|ext| ext.to_str()) {
                Some("vert") => shaderc::ShaderKind::Vertex,
                Some("frag") => shaderc::ShaderKind::Fragment,
                _ => continue,
            };

            let source = fs::read_to_string(&path)?;
            let binary = compiler
                .compile_into_spirv(&source, kind, file_name, "main", None)
                .map_err(|e| format!("{file_name}: {e}"))?;
            fs::write(out_dir.join(format!("{file_name}.spv")), binary.as_binary_u8())?;
        }

        Ok(())
    }
}
