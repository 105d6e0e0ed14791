//! Loader functions, one per task kind, fixed when the task system is built.

use std::any::Any;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::payload::{MaterialData, MeshData, TaskOutput, TaskRequest, Texture};

pub type PathLoader<T> = Arc<dyn Fn(&Path) -> Result<T, String> + Send + Sync>;
pub type ValueLoader<T> = Arc<dyn Fn(T) -> Result<T, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct LoaderRegistry {
    texture: Option<PathLoader<Texture>>,
    scene: Option<PathLoader<Box<dyn Any + Send>>>,
    mesh: Option<ValueLoader<MeshData>>,
    material: Option<ValueLoader<MaterialData>>,
    blob: Option<PathLoader<Vec<u8>>>,
}

impl LoaderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self::empty()
            .with_texture_loader(load_png)
            .with_blob_loader(load_blob)
            .with_mesh_loader(validate_mesh)
            .with_material_loader(validate_material)
    }

    pub fn with_texture_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&Path) -> Result<Texture, String> + Send + Sync + 'static,
    {
        self.texture = Some(Arc::new(loader));
        self
    }

    pub fn with_scene_loader<T, F>(mut self, loader: F) -> Self
    where
        T: Any + Send,
        F: Fn(&Path) -> Result<T, String> + Send + Sync + 'static,
    {
        self.scene = Some(Arc::new(move |path: &Path| {
            loader(path).map(|scene| Box::new(scene) as Box<dyn Any + Send>)
        }));
        self
    }

    pub fn with_mesh_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(MeshData) -> Result<MeshData, String> + Send + Sync + 'static,
    {
        self.mesh = Some(Arc::new(loader));
        self
    }

    pub fn with_material_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(MaterialData) -> Result<MaterialData, String> + Send + Sync + 'static,
    {
        self.material = Some(Arc::new(loader));
        self
    }

    pub fn with_blob_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&Path) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.blob = Some(Arc::new(loader));
        self
    }

    pub(crate) fn dispatch(&self, request: TaskRequest) -> Result<TaskOutput, String> {
        match request {
            TaskRequest::Texture(path) => {
                let loader = self.texture.as_ref().ok_or("no texture loader registered")?;
                loader(&path).map(TaskOutput::Texture)
            }
            TaskRequest::Scene(path) => {
                let loader = self.scene.as_ref().ok_or("no scene loader registered")?;
                loader(&path).map(TaskOutput::Scene)
            }
            TaskRequest::Mesh(mesh) => {
                let loader = self.mesh.as_ref().ok_or("no mesh loader registered")?;
                loader(mesh).map(TaskOutput::Mesh)
            }
            TaskRequest::Material(material) => {
                let loader = self
                    .material
                    .as_ref()
                    .ok_or("no material loader registered")?;
                loader(material).map(TaskOutput::Material)
            }
            TaskRequest::Blob(path) => {
                let loader = self.blob.as_ref().ok_or("no blob loader registered")?;
                loader(&path).map(TaskOutput::Blob)
            }
            TaskRequest::Custom(work) => work().map(TaskOutput::Custom),
        }
    }
}

pub fn load_png(path: &Path) -> Result<Texture, String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");
    if !extension.eq_ignore_ascii_case("png") {
        return Err(format!("unsupported texture extension '{}'", extension));
    }
    let bytes = fs::read(path).map_err(|err| format!("{}: {}", path.display(), err))?;
    decode_png(bytes)
}

pub fn decode_png(bytes: Vec<u8>) -> Result<Texture, String> {
    let decoder = png::Decoder::new(Cursor::new(bytes));
    let mut reader = decoder.read_info().map_err(|err| err.to_string())?;
    if reader.info().bit_depth != png::BitDepth::Eight {
        return Err("png bit depth must be 8".to_string());
    }
    let mut buf = vec![0; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buf).map_err(|err| err.to_string())?;
    let pixels = &buf[..frame.buffer_size()];
    let texel_count = frame.width as usize * frame.height as usize;
    let rgba = match frame.color_type {
        png::ColorType::Rgba => pixels.to_vec(),
        png::ColorType::Rgb => expand(pixels, 3, texel_count, |px| [px[0], px[1], px[2], 255]),
        png::ColorType::Grayscale => expand(pixels, 1, texel_count, |px| [px[0], px[0], px[0], 255]),
        png::ColorType::GrayscaleAlpha => {
            expand(pixels, 2, texel_count, |px| [px[0], px[0], px[0], px[1]])
        }
        other => return Err(format!("unsupported png color type {:?}", other)),
    };
    Ok(Texture {
        width: frame.width,
        height: frame.height,
        rgba: Arc::new(rgba),
    })
}

fn expand(pixels: &[u8], stride: usize, texels: usize, to_rgba: impl Fn(&[u8]) -> [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(texels * 4);
    for px in pixels.chunks_exact(stride) {
        out.extend_from_slice(&to_rgba(px));
    }
    out
}

pub fn load_blob(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|err| format!("{}: {}", path.display(), err))
}

pub fn validate_mesh(mesh: MeshData) -> Result<MeshData, String> {
    if mesh.positions.is_empty() {
        return Err("mesh has no vertices".to_string());
    }
    if mesh.indices.len() % 3 != 0 {
        return Err(format!(
            "mesh index count {} is not a multiple of 3",
            mesh.indices.len()
        ));
    }
    let vertex_count = mesh.positions.len();
    if !mesh.normals.is_empty() && mesh.normals.len() != vertex_count {
        return Err(format!(
            "mesh has {} normals for {} vertices",
            mesh.normals.len(),
            vertex_count
        ));
    }
    if !mesh.uvs.is_empty() && mesh.uvs.len() != vertex_count {
        return Err(format!(
            "mesh has {} uvs for {} vertices",
            mesh.uvs.len(),
            vertex_count
        ));
    }
    if let Some(index) = mesh.indices.iter().find(|index| **index as usize >= vertex_count) {
        return Err(format!(
            "mesh index {} out of range for {} vertices",
            index, vertex_count
        ));
    }
    Ok(mesh)
}

pub fn validate_material(material: MaterialData) -> Result<MaterialData, String> {
    let unit = |value: f32| (0.0..=1.0).contains(&value);
    if !material.base_color.iter().copied().all(unit) {
        return Err(format!(
            "material '{}' base color out of range",
            material.name
        ));
    }
    if !unit(material.metallic) || !unit(material.roughness) {
        return Err(format!(
            "material '{}' metallic/roughness out of range",
            material.name
        ));
    }
    Ok(material)
}

#[cfg(test)]
pub(crate) fn write_test_png(
    path: &Path,
    width: u32,
    height: u32,
    color: png::ColorType,
    data: &[u8],
) {
    let file = fs::File::create(path).expect("create png");
    let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), width, height);
    encoder.set_color(color);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().expect("png header");
    writer.write_image_data(data).expect("png data");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn decodes_rgb_png_to_rgba() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("checker.png");
        write_test_png(
            &path,
            2,
            1,
            png::ColorType::Rgb,
            &[255, 0, 0, 0, 0, 255],
        );
        let texture = load_png(&path).expect("decode");
        assert_eq!((texture.width, texture.height), (2, 1));
        assert_eq!(*texture.rgba, vec![255, 0, 0, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn decodes_grayscale_alpha_png() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("mask.PNG");
        write_test_png(&path, 1, 1, png::ColorType::GrayscaleAlpha, &[40, 128]);
        let texture = load_png(&path).expect("decode");
        assert_eq!(*texture.rgba, vec![40, 40, 40, 128]);
    }

    #[test]
    fn rejects_non_png_paths_and_garbage() {
        let err = load_png(Path::new("texture.tga")).expect_err("extension");
        assert!(err.contains("tga"));
        assert!(decode_png(b"not a png".to_vec()).is_err());
    }

    #[test]
    fn blob_loader_reports_missing_file() {
        let err = load_blob(Path::new("/definitely/missing.bin")).expect_err("missing");
        assert!(err.contains("missing.bin"));
    }

    #[test]
    fn mesh_validation() {
        let triangle = MeshData {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..MeshData::default()
        };
        assert!(validate_mesh(triangle.clone()).is_ok());

        let bad_index = MeshData {
            indices: vec![0, 1, 3],
            ..triangle.clone()
        };
        assert!(validate_mesh(bad_index).expect_err("range").contains("out of range"));

        let bad_normals = MeshData {
            normals: vec![[0.0, 0.0, 1.0]],
            ..triangle
        };
        assert!(validate_mesh(bad_normals).is_err());
        assert!(validate_mesh(MeshData::default()).is_err());
    }

    #[test]
    fn material_validation() {
        assert!(validate_material(MaterialData::default()).is_ok());
        let shiny = MaterialData {
            name: "chrome".to_string(),
            metallic: 1.5,
            ..MaterialData::default()
        };
        assert!(validate_material(shiny).expect_err("range").contains("chrome"));
    }

    #[test]
    fn missing_loader_is_an_error() {
        let registry = LoaderRegistry::empty();
        let err = registry
            .dispatch(TaskRequest::Scene(PathBuf::from("level.scene")))
            .expect_err("no loader");
        assert_eq!(err, "no scene loader registered");
    }

    #[test]
    fn registered_scene_loader_is_used() {
        let registry = LoaderRegistry::with_defaults()
            .with_scene_loader(|path: &Path| Ok(path.display().to_string()));
        let output = registry
            .dispatch(TaskRequest::Scene(PathBuf::from("level.scene")))
            .expect("scene");
        let TaskOutput::Scene(scene) = output else {
            panic!("expected scene output");
        };
        assert_eq!(
            scene.downcast_ref::<String>().map(String::as_str),
            Some("level.scene")
        );
    }
}
