use std::any::Any;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Texture,
    Scene,
    Mesh,
    Material,
    Blob,
    Custom,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Texture => "texture",
            TaskKind::Scene => "scene",
            TaskKind::Mesh => "mesh",
            TaskKind::Material => "material",
            TaskKind::Blob => "blob",
            TaskKind::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub rgba: Arc<Vec<u8>>,
}

impl Texture {
    pub fn byte_len(&self) -> usize {
        self.rgba.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn byte_len(&self) -> usize {
        self.positions.len() * mem::size_of::<[f32; 3]>()
            + self.normals.len() * mem::size_of::<[f32; 3]>()
            + self.uvs.len() * mem::size_of::<[f32; 2]>()
            + self.indices.len() * mem::size_of::<u32>()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MaterialData {
    pub name: String,
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub textures: Vec<PathBuf>,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: [1.0, 1.0, 1.0, 1.0],
            metallic: 0.0,
            roughness: 1.0,
            textures: Vec::new(),
        }
    }
}

impl MaterialData {
    pub fn byte_len(&self) -> usize {
        self.name.len()
            + self
                .textures
                .iter()
                .map(|path| path.as_os_str().len())
                .sum::<usize>()
    }
}

pub type CustomFn = Box<dyn FnOnce() -> Result<Box<dyn Any + Send>, String> + Send + 'static>;

pub enum TaskRequest {
    Texture(PathBuf),
    Scene(PathBuf),
    Mesh(MeshData),
    Material(MaterialData),
    Blob(PathBuf),
    Custom(CustomFn),
}

impl TaskRequest {
    pub fn custom<T, F>(work: F) -> Self
    where
        T: Any + Send,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        TaskRequest::Custom(Box::new(move || {
            work().map(|value| Box::new(value) as Box<dyn Any + Send>)
        }))
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::Texture(_) => TaskKind::Texture,
            TaskRequest::Scene(_) => TaskKind::Scene,
            TaskRequest::Mesh(_) => TaskKind::Mesh,
            TaskRequest::Material(_) => TaskKind::Material,
            TaskRequest::Blob(_) => TaskKind::Blob,
            TaskRequest::Custom(_) => TaskKind::Custom,
        }
    }

    pub fn payload_bytes(&self) -> usize {
        match self {
            TaskRequest::Texture(path) | TaskRequest::Scene(path) | TaskRequest::Blob(path) => {
                path.as_os_str().len()
            }
            TaskRequest::Mesh(mesh) => mesh.byte_len(),
            TaskRequest::Material(material) => material.byte_len(),
            TaskRequest::Custom(_) => 0,
        }
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRequest::Texture(path) => f.debug_tuple("Texture").field(path).finish(),
            TaskRequest::Scene(path) => f.debug_tuple("Scene").field(path).finish(),
            TaskRequest::Mesh(mesh) => f.debug_tuple("Mesh").field(mesh).finish(),
            TaskRequest::Material(material) => f.debug_tuple("Material").field(material).finish(),
            TaskRequest::Blob(path) => f.debug_tuple("Blob").field(path).finish(),
            TaskRequest::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

pub enum TaskOutput {
    Texture(Texture),
    Scene(Box<dyn Any + Send>),
    Mesh(MeshData),
    Material(MaterialData),
    Blob(Vec<u8>),
    Custom(Box<dyn Any + Send>),
}

impl TaskOutput {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskOutput::Texture(_) => TaskKind::Texture,
            TaskOutput::Scene(_) => TaskKind::Scene,
            TaskOutput::Mesh(_) => TaskKind::Mesh,
            TaskOutput::Material(_) => TaskKind::Material,
            TaskOutput::Blob(_) => TaskKind::Blob,
            TaskOutput::Custom(_) => TaskKind::Custom,
        }
    }
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutput::Texture(texture) => f.debug_tuple("Texture").field(texture).finish(),
            TaskOutput::Scene(_) => f.write_str("Scene(..)"),
            TaskOutput::Mesh(mesh) => f.debug_tuple("Mesh").field(mesh).finish(),
            TaskOutput::Material(material) => f.debug_tuple("Material").field(material).finish(),
            TaskOutput::Blob(bytes) => write!(f, "Blob({} bytes)", bytes.len()),
            TaskOutput::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
