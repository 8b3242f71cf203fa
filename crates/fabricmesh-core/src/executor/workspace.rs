//! Per-job workspace materialization and output collection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::job::Job;

/// Creates a fresh temp directory named after the job id and writes the
/// entry file plus any accompanying files into it.
pub fn prepare(job: &Job) -> Result<tempfile::TempDir> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("homie_{}_", job.job_id))
        .tempdir()?;

    write_file(dir.path(), &job.filename, &job.code)?;
    for (relpath, content) in &job.files {
        write_file(dir.path(), relpath, content)?;
    }

    Ok(dir)
}

fn write_file(root: &Path, relpath: &str, content: &[u8]) -> Result<()> {
    let path = root.join(relpath);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Walk the workspace; anything whose relative path isn't among the
/// job's declared inputs is an output artifact.
pub fn collect_outputs(workspace: &Path, job: &Job) -> Result<HashMap<String, Vec<u8>>> {
    let inputs = job.input_paths();
    let mut outputs = HashMap::new();
    walk(workspace, workspace, &inputs, &mut outputs)?;
    Ok(outputs)
}

fn walk(
    root: &Path,
    dir: &Path,
    inputs: &std::collections::HashSet<String>,
    outputs: &mut HashMap<String, Vec<u8>>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, inputs, outputs)?;
            continue;
        }
        let relpath = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        if inputs.contains(&relpath) {
            continue;
        }
        if let Ok(content) = std::fs::read(&path) {
            outputs.insert(relpath, content);
        }
    }
    Ok(())
}

pub fn remove(path: &PathBuf) {
    let _ = std::fs::remove_dir_all(path);
}
