//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / ListFilesTool 基于 SafeFs 提供读文件与列目录能力。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{parse_args, ParameterSchema, Tool};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 检查路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {}", path))
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {}", e))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| format!("List failed: {}", e))? {
            let e = e.map_err(|e| e.to_string())?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path relative to the workspace
    pub path: String,
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file inside the workspace."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::for_type::<ReadFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ReadFileArgs = parse_args(args)?;
        tracing::info!(path = %args.path, "read_file tool execute");
        self.fs.read_file(&args.path)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// Directory to list, relative to the workspace ('.' for the root)
    pub directory: String,
}

/// 列出目录
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory inside the workspace. Directories end with '/'."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::for_type::<ListFilesArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ListFilesArgs = parse_args(args)?;
        tracing::info!(directory = %args.directory, "list_files tool execute");
        let entries = self.fs.list_dir(&args.directory)?;
        if entries.is_empty() {
            Ok("(empty directory)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}
