//! Filesystem tasks, loaded when `fs` appears in `modules.enabled`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use halogen_protocol::{Chain, Event, EventKind, TaskError};

use crate::event_bus::Emitter;
use crate::module::{Module, ModuleContext, Operations};

pub const NAME: &str = "fs";

/// Entries shown by `list_directory` before the listing is cut short.
const LIST_LIMIT: usize = 16;
const DEFAULT_READ_LINES: usize = 10;

pub struct FsModule {
    emitter: Emitter,
}

impl FsModule {
    pub fn new(context: ModuleContext) -> Self {
        Self {
            emitter: context.emitter,
        }
    }
}

#[async_trait]
impl Module for FsModule {
    fn name(&self) -> &str {
        NAME
    }

    fn info(&self) -> String {
        "Read, write and list files".to_string()
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let chain = self.emitter.chain(None);
        self.emitter
            .debug(chain, format!("Relative paths resolve against {}", cwd.display()));
        Ok(())
    }

    async fn end(&mut self) -> (bool, String) {
        (true, "Filesystem module stopped.".to_string())
    }

    fn handled_events(&self) -> Vec<EventKind> {
        Vec::new()
    }

    async fn handle(&mut self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }

    fn operations(&self) -> Operations {
        Operations::new()
            .task("read_file", &["path", "lines"], "Show the first lines of a file (default 10)", read_file)
            .task("write_to_file", &["path", "content"], "Replace a file's content", write_to_file)
            .task("append_to_file", &["path", "content"], "Append to a file", append_to_file)
            .task("list_directory", &["path"], "List a directory", list_directory)
            .task("make_directory", &["path"], "Create a directory and its parents", make_directory)
            .task("create_file", &["path"], "Create an empty file", create_file)
            .task("remove_file", &["path"], "Delete a file", remove_file)
    }
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, TaskError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| TaskError::failed(format!("Missing argument '{name}'")))
}

/// Everything from `index` on, joined by spaces.
fn rest(args: &[String], index: usize, name: &str) -> Result<String, TaskError> {
    arg(args, index, name)?;
    Ok(args[index..].join(" "))
}

pub fn read_file(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    let lines = match args.get(1) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| TaskError::failed(format!("Invalid line count '{raw}'")))?,
        None => DEFAULT_READ_LINES,
    };
    if !Path::new(path).is_file() {
        return Err(TaskError::failed(format!("File '{path}' does not exist")));
    }
    let content = fs::read_to_string(path)?;
    Ok(content.lines().take(lines).collect::<Vec<_>>().join("\n"))
}

pub fn write_to_file(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    let content = rest(args, 1, "content")?;
    fs::write(path, &content)?;
    Ok(format!("Wrote {} bytes to '{path}'", content.len()))
}

pub fn append_to_file(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    let content = rest(args, 1, "content")?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(format!("Appended {} bytes to '{path}'", content.len()))
}

pub fn list_directory(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    if !Path::new(path).is_dir() {
        return Err(TaskError::failed(format!("Directory '{path}' does not exist")));
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let total = names.len();
    if total > LIST_LIMIT {
        names.truncate(LIST_LIMIT);
        names.push(format!("... and {} more", total - LIST_LIMIT));
    }
    Ok(names.join("\n"))
}

pub fn make_directory(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    if Path::new(path).exists() {
        return Err(TaskError::failed(format!("'{path}' already exists")));
    }
    fs::create_dir_all(path)?;
    Ok(format!("Created directory '{path}'"))
}

pub fn create_file(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    if Path::new(path).exists() {
        return Err(TaskError::failed(format!("'{path}' already exists")));
    }
    fs::File::create_new(path)?;
    Ok(format!("Created file '{path}'"))
}

pub fn remove_file(_chain: Chain, args: &[String]) -> Result<String, TaskError> {
    let path = arg(args, 0, "path")?;
    if !Path::new(path).is_file() {
        return Err(TaskError::failed(format!("File '{path}' does not exist")));
    }
    fs::remove_file(path)?;
    Ok(format!("Removed file '{path}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn path_of(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_read_file_limits_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_of(&dir, "notes.txt");
        fs::write(&path, "one\ntwo\nthree\n").unwrap();

        assert_eq!(read_file(Chain::default(), &args(&[&path, "2"])).unwrap(), "one\ntwo");
        assert_eq!(
            read_file(Chain::default(), &args(&[&path])).unwrap(),
            "one\ntwo\nthree"
        );
    }

    #[test]
    fn test_read_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_of(&dir, "absent.txt");
        let err = read_file(Chain::default(), &args(&[&path])).unwrap_err();
        assert_eq!(err.to_string(), format!("Error: File '{path}' does not exist"));
        assert!(read_file(Chain::default(), &[]).is_err());
    }

    #[test]
    fn test_write_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_of(&dir, "out.txt");
        write_to_file(Chain::default(), &args(&[&path, "hello", "world"])).unwrap();
        append_to_file(Chain::default(), &args(&[&path, "!"])).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world!");
    }

    #[test]
    fn test_create_and_remove_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_of(&dir, "empty");
        create_file(Chain::default(), &args(&[&path])).unwrap();
        assert!(create_file(Chain::default(), &args(&[&path])).is_err());
        remove_file(Chain::default(), &args(&[&path])).unwrap();
        assert!(!Path::new(&path).exists());
        assert!(remove_file(Chain::default(), &args(&[&path])).is_err());
    }

    #[test]
    fn test_list_directory_truncates() {
        let dir = tempfile::tempdir().unwrap();
        for n in 0..20 {
            fs::write(dir.path().join(format!("f{n:02}")), "").unwrap();
        }
        make_directory(Chain::default(), &args(&[&path_of(&dir, "sub/deeper")])).unwrap();

        let listing = list_directory(Chain::default(), &args(&[&path_of(&dir, "")])).unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), LIST_LIMIT + 1);
        assert_eq!(lines[0], "f00");
        assert_eq!(lines[LIST_LIMIT], "... and 5 more");
    }
}
