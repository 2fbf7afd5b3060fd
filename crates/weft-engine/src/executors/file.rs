use std::path::{Component, Path, PathBuf};

use futures::future::BoxFuture;
use serde_json::json;

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::{FileNode, FileOperation, NodeKind, NodeResult, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};
use crate::evaluator::substitute_in;

/// Local file operations, confined to the project folder by default.
pub struct FileExecutor;

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn escapes(raw: &str, node: &WorkflowNode) -> WeftError {
    WeftError::Validation {
        node: node.id.clone(),
        message: format!("path '{}' escapes the project folder", raw),
    }
}

/// Deepest existing ancestor of `path` with symlinks resolved. `None` when
/// the path itself is a dangling symlink.
async fn real_ancestor(path: &Path) -> Result<Option<PathBuf>> {
    let mut current = path;
    loop {
        match tokio::fs::canonicalize(current).await {
            Ok(real) => return Ok(Some(real)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::symlink_metadata(current).await.is_ok() {
                    return Ok(None);
                }
                match current.parent() {
                    Some(parent) => current = parent,
                    None => return Ok(Some(current.to_path_buf())),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn resolve(raw: &str, project: &Path, confine: bool, node: &WorkflowNode) -> Result<PathBuf> {
    let project = if project.is_absolute() {
        normalize(project)
    } else {
        normalize(&std::env::current_dir()?.join(project))
    };
    let candidate = PathBuf::from(raw);
    let path = if candidate.is_absolute() {
        normalize(&candidate)
    } else {
        normalize(&project.join(candidate))
    };
    if !confine {
        return Ok(path);
    }
    if !path.starts_with(&project) {
        return Err(escapes(raw, node));
    }

    // Symlinks inside the project may still point outside it
    let real_project = tokio::fs::canonicalize(&project)
        .await
        .unwrap_or_else(|_| project.clone());
    match real_ancestor(&path).await? {
        Some(real) if real.starts_with(&real_project) => Ok(path),
        _ => Err(escapes(raw, node)),
    }
}

async fn destination(
    spec: &FileNode,
    ctx: &NodeContext,
    confine: bool,
    node: &WorkflowNode,
) -> Result<PathBuf> {
    let raw = spec.destination.as_deref().ok_or_else(|| WeftError::Validation {
        node: node.id.clone(),
        message: format!("{:?} needs a destination", spec.operation),
    })?;
    let raw = substitute_in(raw, &ctx.scope).text;
    resolve(&raw, &ctx.project_folder, confine, node).await
}

fn not_found(path: &Path) -> WeftError {
    WeftError::execution(format!("File not found: {}", path.display()))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

impl NodeExecutor for FileExecutor {
    fn name(&self) -> &str {
        "file_operation"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let NodeKind::FileOperation(spec) = &node.kind else {
                return Err(kind_mismatch(node, self.name()));
            };
            let confine = spec.require_project_folder;
            let raw_path = substitute_in(&spec.path, &ctx.scope).text;
            let path = resolve(&raw_path, &ctx.project_folder, confine, node).await?;

            let output = match spec.operation {
                FileOperation::Read => {
                    let content = match tokio::fs::read_to_string(&path).await {
                        Ok(content) => content,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            return Err(not_found(&path))
                        }
                        Err(e) => return Err(e.into()),
                    };
                    json!({ "path": path.display().to_string(), "content": content })
                }
                FileOperation::Write => {
                    let content = spec
                        .content
                        .as_deref()
                        .map(|c| substitute_in(c, &ctx.scope).text)
                        .unwrap_or_default();
                    ensure_parent(&path).await?;
                    tokio::fs::write(&path, content.as_bytes()).await?;
                    json!({ "path": path.display().to_string(), "bytesWritten": content.len() })
                }
                FileOperation::Copy => {
                    let dst = destination(spec, &ctx, confine, node).await?;
                    if !tokio::fs::try_exists(&path).await? {
                        return Err(not_found(&path));
                    }
                    ensure_parent(&dst).await?;
                    let bytes = tokio::fs::copy(&path, &dst).await?;
                    json!({
                        "path": path.display().to_string(),
                        "destination": dst.display().to_string(),
                        "bytesCopied": bytes,
                    })
                }
                FileOperation::Move => {
                    let dst = destination(spec, &ctx, confine, node).await?;
                    if !tokio::fs::try_exists(&path).await? {
                        return Err(not_found(&path));
                    }
                    ensure_parent(&dst).await?;
                    tokio::fs::rename(&path, &dst).await?;
                    json!({
                        "path": path.display().to_string(),
                        "destination": dst.display().to_string(),
                    })
                }
                FileOperation::Delete => {
                    let deleted = match tokio::fs::metadata(&path).await {
                        Ok(meta) => {
                            if meta.is_dir() {
                                tokio::fs::remove_dir_all(&path).await?;
                            } else {
                                tokio::fs::remove_file(&path).await?;
                            }
                            true
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                        Err(e) => return Err(e.into()),
                    };
                    json!({ "path": path.display().to_string(), "deleted": deleted })
                }
                FileOperation::Exists => {
                    let exists = tokio::fs::try_exists(&path).await?;
                    json!({ "path": path.display().to_string(), "exists": exists })
                }
            };

            Ok(NodeResult::new(output))
        })
    }
}
