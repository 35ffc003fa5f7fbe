use crate::error::{Error, Result};
use crate::hw::config;
#[cfg(unix)]
use nix::libc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[cfg(unix)]
const RT_POLICY: i32 = libc::SCHED_FIFO;
pub const RT_PRIORITY_PROCESS: i32 = 18;
pub const RT_PRIORITY_SLAVE: i32 = 16;
pub const RT_PRIORITY_MIDI: i32 = 14;

pub fn configure_rt_thread(name: &str, priority: i32) -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, RT_POLICY, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam({}, prio {}) failed with errno {}",
                name, priority, rc
            ));
        }

        let mut actual_policy = 0_i32;
        let mut actual_param = unsafe { std::mem::zeroed::<libc::sched_param>() };
        let rc = unsafe { libc::pthread_getschedparam(thread, &mut actual_policy, &mut actual_param) };
        if rc != 0 {
            return Err(format!(
                "pthread_getschedparam({}) failed with errno {}",
                name, rc
            ));
        }
        if actual_policy != RT_POLICY || actual_param.sched_priority != priority {
            return Err(format!(
                "realtime verification failed for {}: policy {}, prio {}",
                name, actual_policy, actual_param.sched_priority
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = name;
        let _ = priority;
        Err("Realtime thread priority is not supported on this platform".to_string())
    }
}

pub fn lock_memory_pages() -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(format!(
                "mlockall(MCL_CURRENT|MCL_FUTURE) failed: {}",
                std::io::Error::last_os_error()
            ))
        }
    }
    #[cfg(not(unix))]
    {
        Err("mlockall is not supported on this platform".to_string())
    }
}

/// Spawns a named thread and asks for SCHED_FIFO at `priority` inside it.
///
/// Scheduling failures fall back to normal priority with a warning; only a
/// failure to create the thread is an error.
pub fn spawn_rt_thread<T, F>(
    name: &'static str,
    priority: Option<i32>,
    f: F,
) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(priority) = priority
                && !config::realtime_disabled()
            {
                match configure_rt_thread(name, priority) {
                    Ok(()) => debug!("{name}: running with SCHED_FIFO priority {priority}"),
                    Err(e) => warn!("{name}: falling back to normal scheduling: {e}"),
                }
            }
            f()
        })
        .map_err(|_| Error::ThreadSpawn(name))
}
