use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::UNIX_EPOCH;

use crate::bridge::HandleState;
use crate::error::CoreError;
use crate::registry::{HandleId, HandleSlot};
use crate::runtime::RuntimeHandle;
use crate::script::FsMode;
use crate::value::{Table, Value};

/// An open file. Filesystem ops are synchronous at the script surface;
/// plain files never arm loop callbacks, so close is single-phase.
pub struct FileHandle {
    pub(crate) id: Cell<HandleId>,
    pub(crate) state: Cell<HandleState>,
    file: RefCell<std::fs::File>,
}

fn fs_err(e: std::io::Error) -> CoreError {
    CoreError::FsFailed(e.to_string())
}

pub fn open(rt: &RuntimeHandle, path: &str, mode: FsMode) -> Result<Vec<Value>, CoreError> {
    let mut opts = std::fs::OpenOptions::new();
    match mode {
        FsMode::Read => opts.read(true),
        FsMode::Write => opts.write(true).create(true).truncate(true),
        FsMode::Append => opts.append(true).create(true),
    };
    let file = opts.open(path).map_err(fs_err)?;
    let handle = Rc::new(FileHandle {
        id: Cell::new(HandleId(usize::MAX)),
        state: Cell::new(HandleState::Open),
        file: RefCell::new(file),
    });
    let id = rt
        .root
        .registry
        .borrow_mut()
        .insert(HandleSlot::File(handle.clone()));
    handle.id.set(id);
    Ok(vec![Value::handle(id)])
}

pub fn read(rt: &RuntimeHandle, file: HandleId, max: usize) -> Result<Vec<Value>, CoreError> {
    let f = rt.root.registry.borrow().get_file(file)?;
    if f.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }
    let cap = if max == 0 { rt.read_buffer_size() } else { max };
    let mut buf = vec![0u8; cap];
    let n = f.file.borrow_mut().read(&mut buf).map_err(fs_err)?;
    if n == 0 {
        return Ok(vec![Value::Nil]);
    }
    buf.truncate(n);
    Ok(vec![Value::Bytes(Bytes::from(buf))])
}

pub fn write(rt: &RuntimeHandle, file: HandleId, data: Bytes) -> Result<Vec<Value>, CoreError> {
    let f = rt.root.registry.borrow().get_file(file)?;
    if f.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }
    f.file.borrow_mut().write_all(&data).map_err(fs_err)?;
    Ok(vec![])
}

pub fn stat(path: &str) -> Result<Vec<Value>, CoreError> {
    let meta = std::fs::metadata(path).map_err(fs_err)?;
    let mut t = Table::new();
    t.set("size", Value::Int(meta.len() as i64));
    t.set("kind", Value::Str(kind_name(&meta.file_type()).to_string()));
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    t.set("modified_ms", Value::Int(modified_ms));
    Ok(vec![Value::Table(t)])
}

pub fn scandir(path: &str) -> Result<Vec<Value>, CoreError> {
    let mut out = Table::new();
    for entry in std::fs::read_dir(path).map_err(fs_err)? {
        let entry = entry.map_err(fs_err)?;
        let mut row = Table::new();
        row.set(
            "name",
            Value::Str(entry.file_name().to_string_lossy().into_owned()),
        );
        let kind = entry
            .file_type()
            .map(|t| kind_name(&t))
            .unwrap_or("other");
        row.set("kind", Value::Str(kind.to_string()));
        out.push(Value::Table(row));
    }
    Ok(vec![Value::Table(out)])
}

pub fn unlink(path: &str) -> Result<Vec<Value>, CoreError> {
    std::fs::remove_file(path).map_err(fs_err)?;
    Ok(vec![])
}

fn kind_name(t: &std::fs::FileType) -> &'static str {
    if t.is_file() {
        "file"
    } else if t.is_dir() {
        "dir"
    } else {
        "other"
    }
}

pub(crate) fn close(rt: &RuntimeHandle, f: Rc<FileHandle>) {
    if f.state.get() != HandleState::Open {
        return;
    }
    f.state.set(HandleState::Closed);
    rt.root.registry.borrow_mut().remove(f.id.get());
}
