//! Basic facts about the host and the running process, gathered once at
//! daemon startup and logged for operators.

use std::ffi::CStr;

#[derive(Debug, Clone)]
pub struct SysInfo {
    pub hostname: String,
    pub pid: i32,
    pub cores: usize,
    pub page_size: usize,
}

impl SysInfo {
    pub fn gather() -> SysInfo {
        SysInfo {
            hostname: hostname(),
            pid: unsafe { libc::getpid() },
            cores: sysconf(libc::_SC_NPROCESSORS_ONLN, 1),
            page_size: sysconf(libc::_SC_PAGESIZE, 4096),
        }
    }
}

fn hostname() -> String {
    let mut buf = [0i8; 256];

    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }

    // gethostname may leave the buffer unterminated on truncation.
    buf[buf.len() - 1] = 0;

    unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned()
}

fn sysconf(name: libc::c_int, fallback: usize) -> usize {
    let value = unsafe { libc::sysconf(name) };
    if value <= 0 {
        fallback
    } else {
        value as usize
    }
}
