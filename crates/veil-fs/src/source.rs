use std::io;

/// Something that fills a buffer with packed `linux_dirent64` records.
///
/// Dropping the source releases whatever it holds open.
pub trait RawDirectory: Send {
    /// Fill `buf` with whole records and return the number of bytes
    /// written. `Ok(0)` is end of directory.
    fn read_records(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[cfg(target_os = "linux")]
pub use kernel::KernelDirectory;

#[cfg(target_os = "linux")]
mod kernel {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use super::RawDirectory;

    /// A directory descriptor read with `getdents64(2)`.
    #[derive(Debug)]
    pub struct KernelDirectory {
        file: File,
    }

    impl KernelDirectory {
        pub fn open(path: &Path) -> io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
                .open(path)?;
            Ok(Self { file })
        }
    }

    impl RawDirectory for KernelDirectory {
        fn read_records(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let fd = self.file.as_raw_fd();
            loop {
                // SAFETY: `fd` is an open directory owned by `self.file`, and
                // the kernel writes at most `buf.len()` bytes into `buf`.
                #[allow(unsafe_code)]
                let n = unsafe {
                    libc::syscall(
                        libc::SYS_getdents64,
                        fd,
                        buf.as_mut_ptr().cast::<libc::c_void>(),
                        buf.len(),
                    )
                };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}
