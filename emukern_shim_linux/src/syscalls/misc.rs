//! Time, system information, polling, and resource-limit syscalls.

use alloc::vec::Vec;

use emukern::event::wait::WaitError;
use emukern::platform::{Instant as _, SystemTime as _, TimeProvider as _};

use emukern_common_linux::{
    Addr, ClockId, ITimerVal, ItimerWhich, PollEvents, PollFd, RLimit, RlimitResource, SysInfo,
    TimeVal, Timespec, UtsName, errno::Errno,
};

use crate::syscalls::file::NOFILE_LIMIT;
use crate::syscalls::process::ItimerReal;
use crate::{KernelPlatform, Task, loader::DEFAULT_STACK_SIZE};

/// Largest poll set accepted (mirrors the descriptor-table cap).
const MAX_POLL_FDS: usize = NOFILE_LIMIT;

impl<P: KernelPlatform> Task<P> {
    /// Wall-clock time as a duration since the epoch.
    pub(crate) fn wall_clock_duration(&self) -> core::time::Duration {
        let now = self.platform().current_time();
        now.duration_since(&P::SystemTime::UNIX_EPOCH)
            .unwrap_or(core::time::Duration::ZERO)
    }

    fn monotonic_duration(&self) -> core::time::Duration {
        self.platform().now().duration_since(&self.global.boot_time)
    }

    pub(crate) fn sys_uname(&self, buf: Addr) -> Result<(), Errno> {
        let uts = UtsName {
            sysname: UtsName::field("Linux"),
            nodename: UtsName::field("emukern"),
            release: UtsName::field("4.20.69-emukern"),
            version: UtsName::field("#1 SMP"),
            machine: UtsName::field("i686"),
            domainname: UtsName::field("(none)"),
        };
        self.write_user(buf, uts)
    }

    pub(crate) fn sys_sysinfo(&self, buf: Addr) -> Result<(), Errno> {
        // Memory figures are nominal: the host owns real accounting.
        const NOMINAL_RAM: u32 = 0x1000_0000;
        let info = SysInfo {
            uptime: self.monotonic_duration().as_secs() as u32,
            totalram: NOMINAL_RAM,
            freeram: NOMINAL_RAM / 2,
            totalswap: 0,
            freeswap: 0,
            procs: self.global.processes.len() as u16,
            mem_unit: 1,
            ..Default::default()
        };
        self.write_user(buf, info)
    }

    pub(crate) fn sys_time(&self, tloc: Addr) -> Result<u32, Errno> {
        let seconds = self.wall_clock_duration().as_secs() as u32;
        if tloc != 0 {
            self.write_user::<u32>(tloc, seconds)?;
        }
        Ok(seconds)
    }

    pub(crate) fn sys_clock_gettime(&self, clock: ClockId, tp: Addr) -> Result<(), Errno> {
        let duration = match clock {
            ClockId::Realtime => self.wall_clock_duration(),
            ClockId::Monotonic => self.monotonic_duration(),
        };
        self.write_user(tp, Timespec::from_duration(duration))
    }

    pub(crate) fn sys_clock_getres(&self, _clock: ClockId, res: Addr) -> Result<(), Errno> {
        if res == 0 {
            return Ok(());
        }
        self.write_user(res, Timespec { sec: 0, nsec: 1 })
    }

    pub(crate) fn sys_gettimeofday(&self, tv: Addr, _tz: Addr) -> Result<(), Errno> {
        // The timezone argument is obsolete and ignored.
        if tv == 0 {
            return Ok(());
        }
        self.write_user(tv, TimeVal::from_duration(self.wall_clock_duration()))
    }

    pub(crate) fn sys_nanosleep(&self, req: Addr, rem: Addr) -> Result<(), Errno> {
        let request: Timespec = self.read_user(req)?;
        let duration = request.to_duration().ok_or(Errno::EINVAL)?;
        if duration.is_zero() {
            return Ok(());
        }
        let cx = self.wait_cx().with_timeout(duration);
        match cx.sleep() {
            WaitError::TimedOut => Ok(()),
            WaitError::Interrupted => {
                if rem != 0 {
                    let remaining = cx.remaining_timeout().unwrap_or_default();
                    self.write_user(rem, Timespec::from_duration(remaining))?;
                }
                Err(Errno::EINTR)
            }
        }
    }

    pub(crate) fn sys_getitimer(&self, which: ItimerWhich, value: Addr) -> Result<(), Errno> {
        let out = match which {
            ItimerWhich::Real => {
                let inner = self.process.inner.lock();
                match &inner.itimer_real {
                    Some(timer) => {
                        let now = self.platform().now();
                        let remaining = timer.expires.duration_since(&now);
                        ITimerVal {
                            interval: TimeVal::from_duration(
                                timer.interval.unwrap_or(core::time::Duration::ZERO),
                            ),
                            value: TimeVal::from_duration(remaining),
                        }
                    }
                    None => ITimerVal::default(),
                }
            }
            // Virtual/profiling time is not accounted on this surface.
            ItimerWhich::Virtual | ItimerWhich::Prof => ITimerVal::default(),
        };
        self.write_user(value, out)
    }

    pub(crate) fn sys_setitimer(
        &self,
        which: ItimerWhich,
        new_value: Addr,
        old_value: Addr,
    ) -> Result<(), Errno> {
        if !matches!(which, ItimerWhich::Real) {
            self.global
                .log_unsupported(format_args!("setitimer(which = {which:?})"));
            return Err(Errno::EINVAL);
        }
        if old_value != 0 {
            self.sys_getitimer(which, old_value)?;
        }
        if new_value == 0 {
            return Err(Errno::EFAULT);
        }
        let new: ITimerVal = self.read_user(new_value)?;
        let value = new.value.to_duration().ok_or(Errno::EINVAL)?;
        let interval = new.interval.to_duration().ok_or(Errno::EINVAL)?;

        let mut inner = self.process.inner.lock();
        if value.is_zero() {
            inner.itimer_real = None;
        } else {
            let expires = self
                .platform()
                .now()
                .checked_add(value)
                .ok_or(Errno::EINVAL)?;
            inner.itimer_real = Some(ItimerReal {
                expires,
                interval: if interval.is_zero() {
                    None
                } else {
                    Some(interval)
                },
            });
        }
        Ok(())
    }

    pub(crate) fn sys_alarm(&self, seconds: u32) -> Result<u32, Errno> {
        let now = self.platform().now();
        let mut inner = self.process.inner.lock();
        let previous = match &inner.itimer_real {
            Some(timer) => {
                let remaining = timer.expires.duration_since(&now);
                // Round up so a pending alarm never reports zero.
                remaining.as_secs() as u32 + u32::from(remaining.subsec_nanos() > 0)
            }
            None => 0,
        };
        if seconds == 0 {
            inner.itimer_real = None;
        } else {
            let expires = now
                .checked_add(core::time::Duration::from_secs(seconds.into()))
                .ok_or(Errno::EINVAL)?;
            inner.itimer_real = Some(ItimerReal {
                expires,
                interval: None,
            });
        }
        Ok(previous)
    }

    pub(crate) fn sys_poll(&self, fds: Addr, nfds: u32, timeout_ms: i32) -> Result<usize, Errno> {
        let nfds = nfds as usize;
        if nfds > MAX_POLL_FDS {
            return Err(Errno::EINVAL);
        }
        let mut pollfds = Vec::with_capacity(nfds);
        for i in 0..nfds {
            let addr = fds
                .checked_add((i * core::mem::size_of::<PollFd>()) as u32)
                .ok_or(Errno::EFAULT)?;
            pollfds.push(self.read_user::<PollFd>(addr)?);
        }

        let evaluate = |pollfds: &mut [PollFd]| -> usize {
            let mut ready = 0;
            for pfd in pollfds.iter_mut() {
                pfd.revents = 0;
                if pfd.fd < 0 {
                    continue;
                }
                let requested = PollEvents::from_bits_retain(pfd.events as u16);
                let Ok(file) = self.fd_file(pfd.fd) else {
                    pfd.revents = PollEvents::POLLNVAL.bits() as i16;
                    ready += 1;
                    continue;
                };
                // Host-backed regular files and directories never block.
                let mut revents = PollEvents::empty();
                if requested.contains(PollEvents::POLLIN) && file.readable() {
                    revents |= PollEvents::POLLIN;
                }
                if requested.contains(PollEvents::POLLOUT) && file.writable() {
                    revents |= PollEvents::POLLOUT;
                }
                if !revents.is_empty() {
                    pfd.revents = revents.bits() as i16;
                    ready += 1;
                }
            }
            ready
        };

        let mut ready = evaluate(&mut pollfds);
        if ready == 0 && timeout_ms != 0 {
            // Nothing can become ready without an event source, so this is
            // a pure (interruptible) sleep bounded by the timeout.
            let cx = self.wait_cx();
            let cx = if timeout_ms > 0 {
                cx.with_timeout(core::time::Duration::from_millis(timeout_ms as u64))
            } else {
                cx
            };
            match cx.wait_until(|| false) {
                Err(WaitError::TimedOut) => {}
                Err(WaitError::Interrupted) => return Err(Errno::EINTR),
                Ok(()) => {}
            }
            ready = evaluate(&mut pollfds);
        }

        for (i, pfd) in pollfds.iter().enumerate() {
            let addr = fds
                .checked_add((i * core::mem::size_of::<PollFd>()) as u32)
                .ok_or(Errno::EFAULT)?;
            self.write_user(addr, *pfd)?;
        }
        Ok(ready)
    }

    pub(crate) fn sys_pause(&self) -> Result<(), Errno> {
        // Pause only ever returns through a signal.
        let _ = self.wait_cx().sleep();
        Err(Errno::EINTR)
    }

    pub(crate) fn sys_getrlimit(&self, resource: RlimitResource, rlim: Addr) -> Result<(), Errno> {
        const UNLIMITED: u32 = u32::MAX;
        let limit = match resource {
            RlimitResource::Stack => RLimit {
                rlim_cur: DEFAULT_STACK_SIZE as u32,
                rlim_max: UNLIMITED,
            },
            RlimitResource::Nofile => RLimit {
                rlim_cur: NOFILE_LIMIT as u32,
                rlim_max: NOFILE_LIMIT as u32,
            },
            _ => RLimit {
                rlim_cur: UNLIMITED,
                rlim_max: UNLIMITED,
            },
        };
        self.write_user(rlim, limit)
    }

    pub(crate) fn sys_setrlimit(&self, resource: RlimitResource, rlim: Addr) -> Result<(), Errno> {
        // Limits are reported but not enforced; accept and discard.
        let _limit: RLimit = self.read_user(rlim)?;
        self.global
            .log_unsupported(format_args!("setrlimit({resource:?})"));
        Ok(())
    }

    pub(crate) fn sys_getrusage(&self, who: i32, usage: Addr) -> Result<(), Errno> {
        const RUSAGE_SELF: i32 = 0;
        const RUSAGE_CHILDREN: i32 = -1;
        if who != RUSAGE_SELF && who != RUSAGE_CHILDREN {
            return Err(Errno::EINVAL);
        }
        // Resource accounting is not modeled; the record is well-formed but
        // zero.
        self.write_user(usage, emukern_common_linux::RUsage::default())
    }
}
