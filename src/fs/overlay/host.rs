//! Directory-relative host system calls
//!
//! Every name-based operation goes through an already-open directory
//! descriptor, so a path component swapped by the guest between check and
//! use cannot redirect the call.

use nix::dir::Dir;
use nix::errno::Errno;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, Metadata};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use super::entry::{SetAttributes, SetTime};

const DIR_FLAGS: libc::c_int =
    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_NOCTTY | libc::O_CLOEXEC;

const NODE_FLAGS: libc::c_int = libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC;

fn cstr(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    Errno::result(ret).map_err(io::Error::from)
}

fn open_at(dirfd: RawFd, name: &CString, flags: libc::c_int, mode: u32) -> io::Result<OwnedFd> {
    // SAFETY: openat only reads the NUL-terminated name; the result is checked.
    let fd = check(unsafe { libc::openat(dirfd, name.as_ptr(), flags, mode as libc::c_uint) })?;
    // SAFETY: fd was just returned by openat and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// fstat through a descriptor we keep owning
fn fd_metadata(fd: &OwnedFd) -> io::Result<Metadata> {
    File::from(fd.try_clone()?).metadata()
}

/// An open host directory
#[derive(Debug)]
pub struct HostDir {
    fd: OwnedFd,
}

impl HostDir {
    /// Open `path` as a directory without following a final symlink
    pub fn open(path: &Path) -> io::Result<Self> {
        let c_path = cstr(path.as_os_str())?;
        let fd = open_at(libc::AT_FDCWD, &c_path, DIR_FLAGS, 0)?;
        Ok(Self { fd })
    }

    /// Open the directory containing `path`, returning it with the final name
    pub fn open_parent(path: &Path) -> io::Result<(Self, &OsStr)> {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => Ok((Self::open(parent)?, name)),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    /// Host metadata of the directory itself
    pub fn metadata(&self) -> io::Result<Metadata> {
        fd_metadata(&self.fd)
    }

    /// Create a subdirectory
    pub fn mkdir(&self, name: &OsStr, mode: u32) -> io::Result<()> {
        let c_name = cstr(name)?;
        // SAFETY: mkdirat only reads the name; the result is checked.
        check(unsafe {
            libc::mkdirat(self.fd.as_raw_fd(), c_name.as_ptr(), mode as libc::mode_t)
        })?;
        Ok(())
    }

    /// Exclusively create a regular file
    pub fn create_file(&self, name: &OsStr, mode: u32) -> io::Result<File> {
        let c_name = cstr(name)?;
        let flags = libc::O_WRONLY
            | libc::O_CREAT
            | libc::O_EXCL
            | libc::O_NOFOLLOW
            | libc::O_NOCTTY
            | libc::O_CLOEXEC;
        open_at(self.fd.as_raw_fd(), &c_name, flags, mode).map(File::from)
    }

    /// Open an existing file for reading or writing.
    ///
    /// Non-blocking, so a FIFO swapped in under the name cannot stall the
    /// caller; callers check the file type on the returned descriptor.
    pub fn open_file(&self, name: &OsStr, write: bool) -> io::Result<File> {
        let c_name = cstr(name)?;
        let access = if write { libc::O_WRONLY } else { libc::O_RDONLY };
        let flags =
            access | libc::O_NOFOLLOW | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC;
        open_at(self.fd.as_raw_fd(), &c_name, flags, 0).map(File::from)
    }

    /// Reference `name` without opening it for I/O or following a symlink
    pub fn open_node(&self, name: &OsStr) -> io::Result<HostNode> {
        let c_name = cstr(name)?;
        let fd = open_at(self.fd.as_raw_fd(), &c_name, NODE_FLAGS, 0)?;
        let meta = fd_metadata(&fd)?;
        Ok(HostNode { fd, meta })
    }

    /// Create a symlink `name` pointing at `target`
    pub fn symlink(&self, target: &OsStr, name: &OsStr) -> io::Result<()> {
        let c_target = cstr(target)?;
        let c_name = cstr(name)?;
        // SAFETY: symlinkat only reads both strings; the result is checked.
        check(unsafe {
            libc::symlinkat(c_target.as_ptr(), self.fd.as_raw_fd(), c_name.as_ptr())
        })?;
        Ok(())
    }

    /// Read the target of symlink `name`
    pub fn readlink(&self, name: &OsStr) -> io::Result<Vec<u8>> {
        let c_name = cstr(name)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        // SAFETY: the buffer is valid for buf.len() bytes; the result is checked.
        let len = unsafe {
            libc::readlinkat(
                self.fd.as_raw_fd(),
                c_name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        let len = Errno::result(len).map_err(io::Error::from)?;
        buf.truncate(len as usize);
        Ok(buf)
    }

    /// Remove a non-directory
    pub fn unlink(&self, name: &OsStr) -> io::Result<()> {
        self.unlink_at(name, 0)
    }

    /// Remove an empty directory
    pub fn rmdir(&self, name: &OsStr) -> io::Result<()> {
        self.unlink_at(name, libc::AT_REMOVEDIR)
    }

    fn unlink_at(&self, name: &OsStr, flags: libc::c_int) -> io::Result<()> {
        let c_name = cstr(name)?;
        // SAFETY: unlinkat only reads the name; the result is checked.
        check(unsafe { libc::unlinkat(self.fd.as_raw_fd(), c_name.as_ptr(), flags) })?;
        Ok(())
    }

    /// Move `name` from this directory to `new_name` inside `to`
    pub fn rename(&self, name: &OsStr, to: &HostDir, new_name: &OsStr) -> io::Result<()> {
        let c_name = cstr(name)?;
        let c_new = cstr(new_name)?;
        // SAFETY: renameat only reads both names; the result is checked.
        check(unsafe {
            libc::renameat(
                self.fd.as_raw_fd(),
                c_name.as_ptr(),
                to.fd.as_raw_fd(),
                c_new.as_ptr(),
            )
        })?;
        Ok(())
    }

    /// Apply owner and timestamps to symlink `name` itself.
    ///
    /// Symlinks have no mode of their own, so a requested mode is ignored.
    pub fn set_link_attrs_at(&self, name: &OsStr, attrs: &SetAttributes) -> io::Result<()> {
        let c_name = cstr(name)?;
        let fd = self.fd.as_raw_fd();

        if attrs.uid.is_some() || attrs.gid.is_some() {
            // SAFETY: fchownat only reads the name; the result is checked.
            check(unsafe {
                libc::fchownat(
                    fd,
                    c_name.as_ptr(),
                    owner(attrs.uid),
                    owner(attrs.gid),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            })?;
        }

        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let times = [timespec(attrs.atime), timespec(attrs.mtime)];
            // SAFETY: times points at two valid timespecs; the result is checked.
            check(unsafe {
                libc::utimensat(fd, c_name.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
            })?;
        }

        Ok(())
    }

    /// Host metadata of `name`, not following symlinks
    pub fn stat(&self, name: &OsStr) -> io::Result<Metadata> {
        Ok(self.open_node(name)?.meta)
    }

    /// Names of every member except `.` and `..`
    pub fn list(&self) -> io::Result<Vec<OsString>> {
        // A fresh description of the same directory, so the read position
        // is never shared with `self`
        let fd = open_at(self.fd.as_raw_fd(), &cstr(OsStr::new("."))?, DIR_FLAGS, 0)?;
        let mut dir = Dir::from(fd).map_err(io::Error::from)?;

        let mut names = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry.file_name().to_bytes();
            if name != b"." && name != b".." {
                names.push(OsStr::from_bytes(name).to_os_string());
            }
        }
        Ok(names)
    }
}

impl AsRawFd for HostDir {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A host object held by an `O_PATH` descriptor.
///
/// Attribute changes go through `/proc/self/fd`, which names exactly the
/// inode the descriptor holds, so they work on objects the caller may not
/// read and never land on another object swapped in under the name.
#[derive(Debug)]
pub struct HostNode {
    fd: OwnedFd,
    meta: Metadata,
}

impl HostNode {
    pub fn is_symlink(&self) -> bool {
        self.meta.file_type().is_symlink()
    }

    /// Apply attributes to the held object, which must not be a symlink
    pub fn set_attrs(&self, attrs: &SetAttributes) -> io::Result<()> {
        if self.is_symlink() {
            return Err(io::Error::from_raw_os_error(libc::ELOOP));
        }
        let path = CString::new(format!("/proc/self/fd/{}", self.fd.as_raw_fd()))
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        if attrs.uid.is_some() || attrs.gid.is_some() {
            // SAFETY: fchownat only reads the path; the result is checked.
            check(unsafe {
                libc::fchownat(
                    libc::AT_FDCWD,
                    path.as_ptr(),
                    owner(attrs.uid),
                    owner(attrs.gid),
                    0,
                )
            })?;
        }

        if let Some(mode) = attrs.mode {
            // SAFETY: fchmodat only reads the path; the result is checked.
            check(unsafe {
                libc::fchmodat(
                    libc::AT_FDCWD,
                    path.as_ptr(),
                    (mode & 0o7777) as libc::mode_t,
                    0,
                )
            })?;
        }

        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let times = [timespec(attrs.atime), timespec(attrs.mtime)];
            // SAFETY: times points at two valid timespecs; the result is checked.
            check(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) })?;
        }

        Ok(())
    }

    /// Re-stat the held object
    pub fn refresh(&mut self) -> io::Result<&Metadata> {
        self.meta = fd_metadata(&self.fd)?;
        Ok(&self.meta)
    }
}

/// Host metadata of `path` without following a final symlink, resolved
/// through the parent directory descriptor
pub fn lstat(path: &Path) -> io::Result<Metadata> {
    match HostDir::open_parent(path) {
        Ok((dir, name)) => dir.stat(name),
        Err(_) if path.file_name().is_none() => HostDir::open(path)?.metadata(),
        Err(e) => Err(e),
    }
}

/// Apply attributes to the object at `path` without following a final
/// symlink, returning its fresh metadata
pub fn set_path_attrs(path: &Path, attrs: &SetAttributes) -> io::Result<Metadata> {
    let (parent, name) = match HostDir::open_parent(path) {
        Ok(found) => found,
        Err(_) if path.file_name().is_none() => {
            let dir = HostDir::open(path)?;
            set_fd_attrs(&dir, attrs)?;
            return dir.metadata();
        }
        Err(e) => return Err(e),
    };

    let mut node = parent.open_node(name)?;
    if node.is_symlink() {
        parent.set_link_attrs_at(name, attrs)?;
    } else {
        node.set_attrs(attrs)?;
    }
    node.refresh().cloned()
}

/// Apply attributes through an open descriptor
pub fn set_fd_attrs(file: &impl AsRawFd, attrs: &SetAttributes) -> io::Result<()> {
    let fd = file.as_raw_fd();

    if attrs.uid.is_some() || attrs.gid.is_some() {
        // SAFETY: fchown has no memory arguments; the result is checked.
        check(unsafe { libc::fchown(fd, owner(attrs.uid), owner(attrs.gid)) })?;
    }

    if let Some(mode) = attrs.mode {
        // SAFETY: fchmod has no memory arguments; the result is checked.
        check(unsafe { libc::fchmod(fd, (mode & 0o7777) as libc::mode_t) })?;
    }

    if attrs.atime.is_some() || attrs.mtime.is_some() {
        let times = [timespec(attrs.atime), timespec(attrs.mtime)];
        // SAFETY: times points at two valid timespecs; the result is checked.
        check(unsafe { libc::futimens(fd, times.as_ptr()) })?;
    }

    Ok(())
}

/// `-1` leaves the owner unchanged
fn owner(id: Option<u32>) -> u32 {
    id.unwrap_or(u32::MAX)
}

fn timespec(time: Option<SetTime>) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: libc::UTIME_OMIT,
    };
    match time {
        None => {}
        Some(SetTime::ServerCurrent) => ts.tv_nsec = libc::UTIME_NOW,
        Some(SetTime::Client(t)) => {
            let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            ts.tv_sec = since.as_secs() as libc::time_t;
            ts.tv_nsec = since.subsec_nanos() as _;
        }
    }
    ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_read_file() {
        let dir = tempdir().unwrap();
        let host = HostDir::open(dir.path()).unwrap();

        let mut file = host.create_file(OsStr::new("f.txt"), 0o644).unwrap();
        file.write_all(b"data").unwrap();
        drop(file);

        assert_eq!(
            host.create_file(OsStr::new("f.txt"), 0o644)
                .unwrap_err()
                .raw_os_error(),
            Some(libc::EEXIST)
        );

        let mut buf = String::new();
        host.open_file(OsStr::new("f.txt"), false)
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "data");
    }

    #[test]
    fn test_open_refuses_symlinked_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        assert!(HostDir::open(&dir.path().join("real")).is_ok());
        let err = HostDir::open(&dir.path().join("link")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ELOOP));
    }

    #[test]
    fn test_symlink_and_readlink() {
        let dir = tempdir().unwrap();
        let host = HostDir::open(dir.path()).unwrap();
        host.symlink(OsStr::new("target/path"), OsStr::new("ln")).unwrap();
        assert_eq!(host.readlink(OsStr::new("ln")).unwrap(), b"target/path");
        assert!(host.stat(OsStr::new("ln")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_rename_between_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a/x"), b"1").unwrap();

        let a = HostDir::open(&dir.path().join("a")).unwrap();
        let b = HostDir::open(&dir.path().join("b")).unwrap();
        a.rename(OsStr::new("x"), &b, OsStr::new("y")).unwrap();

        assert!(!dir.path().join("a/x").exists());
        assert!(dir.path().join("b/y").exists());
    }

    #[test]
    fn test_node_attrs_and_list() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let host = HostDir::open(dir.path()).unwrap();

        let mtime = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let attrs = SetAttributes {
            mode: Some(0o600),
            mtime: Some(SetTime::Client(mtime)),
            ..Default::default()
        };
        let mut node = host.open_node(OsStr::new("f")).unwrap();
        node.set_attrs(&attrs).unwrap();

        let meta = node.refresh().unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o600);
        assert_eq!(meta.mtime(), 1_000_000);

        assert_eq!(host.list().unwrap(), vec![OsString::from("f")]);
        // Listing twice reads from the start again
        assert_eq!(host.list().unwrap(), vec![OsString::from("f")]);
    }

    #[test]
    fn test_node_attrs_on_unreadable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        let host = HostDir::open(dir.path()).unwrap();
        let attrs = SetAttributes {
            mode: Some(0o640),
            ..Default::default()
        };
        host.open_node(OsStr::new("locked"))
            .unwrap()
            .set_attrs(&attrs)
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().mode() & 0o7777, 0o640);
    }

    #[test]
    fn test_node_refuses_symlink() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let target = outside.path().join("secret");
        std::fs::write(&target, b"").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600)).unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("ln")).unwrap();

        let host = HostDir::open(dir.path()).unwrap();
        let node = host.open_node(OsStr::new("ln")).unwrap();
        assert!(node.is_symlink());

        let attrs = SetAttributes {
            mode: Some(0o777),
            ..Default::default()
        };
        assert_eq!(node.set_attrs(&attrs).unwrap_err().raw_os_error(), Some(libc::ELOOP));
        host.set_link_attrs_at(OsStr::new("ln"), &attrs).unwrap();
        assert_eq!(std::fs::metadata(&target).unwrap().mode() & 0o7777, 0o600);
    }

    #[test]
    fn test_lstat_through_parent() {
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink("/", dir.path().join("ln")).unwrap();

        assert!(lstat(&dir.path().join("ln")).unwrap().file_type().is_symlink());
        assert!(lstat(dir.path()).unwrap().is_dir());
        assert!(lstat(Path::new("/")).unwrap().is_dir());
        assert_eq!(
            lstat(&dir.path().join("missing")).unwrap_err().raw_os_error(),
            Some(libc::ENOENT)
        );
    }

    #[test]
    fn test_reads_follow_descriptor_not_path() {
        let dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/mine"), b"").unwrap();
        std::fs::write(elsewhere.path().join("theirs"), b"").unwrap();

        let host = HostDir::open(&dir.path().join("d")).unwrap();
        std::fs::rename(dir.path().join("d"), dir.path().join("moved")).unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), dir.path().join("d")).unwrap();

        assert_eq!(host.list().unwrap(), vec![OsString::from("mine")]);
        assert!(host.stat(OsStr::new("mine")).unwrap().is_file());
        assert_eq!(
            host.stat(OsStr::new("theirs")).unwrap_err().raw_os_error(),
            Some(libc::ENOENT)
        );
    }

    #[test]
    fn test_rmdir_and_unlink() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/f"), b"").unwrap();
        let host = HostDir::open(dir.path()).unwrap();

        let err = host.rmdir(OsStr::new("d")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));

        let sub = HostDir::open(&dir.path().join("d")).unwrap();
        sub.unlink(OsStr::new("f")).unwrap();
        host.rmdir(OsStr::new("d")).unwrap();
        assert!(!dir.path().join("d").exists());
    }
}
