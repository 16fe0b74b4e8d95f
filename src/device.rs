use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub product_name: String,
    pub unique_id: String,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.product_name, self.unique_id)
    }
}

/// Board number assigned when a device is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(pub u32);

/// Hardware collaborator: discovery, binding, and the single analog write.
pub trait DaqBackend: Send + Sync {
    fn discover(&self) -> Result<Vec<DeviceDescriptor>>;
    fn bind(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle>;
    fn release(&self, handle: DeviceHandle);
    fn write_analog_output(&self, handle: DeviceHandle, channel: u32, range_code: u32, code: u16) -> Result<()>;
}

/// A bound device. The handle is released exactly once, either through
/// [`DeviceSession::release`] or on drop.
pub struct DeviceSession {
    backend: Arc<dyn DaqBackend>,
    descriptor: DeviceDescriptor,
    handle: Option<DeviceHandle>,
}

impl DeviceSession {
    pub fn bind(backend: Arc<dyn DaqBackend>, descriptor: DeviceDescriptor) -> Result<Self> {
        let handle = backend.bind(&descriptor)?;
        info!("Bound {} as board {}", descriptor, handle.0);
        Ok(Self {
            backend,
            descriptor,
            handle: Some(handle),
        })
    }

    pub fn write(&self, channel: u32, range_code: u32, code: u16) -> Result<()> {
        match self.handle {
            Some(handle) => self.backend.write_analog_output(handle, channel, range_code, code),
            None => Err(anyhow!("device {} already released", self.descriptor)),
        }
    }

    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.release(handle);
            info!("Released {}", self.descriptor);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("descriptor", &self.descriptor)
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub channel: u32,
    pub range_code: u32,
    pub code: u16,
}

#[derive(Debug, Default)]
struct SimulatedState {
    writes: Vec<WriteRecord>,
    bound: Vec<DeviceHandle>,
    released: Vec<DeviceHandle>,
    next_board: u32,
}

/// In-memory stand-in for a DAQ board.
#[derive(Debug, Default)]
pub struct SimulatedDaq {
    device_count: usize,
    fail_bind: bool,
    fail_after: Mutex<Option<usize>>,
    successful_writes: AtomicUsize,
    state: Mutex<SimulatedState>,
}

impl SimulatedDaq {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            ..Default::default()
        }
    }

    pub fn with_failing_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    /// Make every write after the next `writes` successful ones fail.
    pub fn fail_after(&self, writes: usize) {
        if let Ok(mut fail_after) = self.fail_after.lock() {
            *fail_after = Some(self.successful_writes.load(Ordering::SeqCst) + writes);
        }
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().map(|s| s.writes.clone()).unwrap_or_default()
    }

    pub fn last_code(&self) -> Option<u16> {
        self.state.lock().ok().and_then(|s| s.writes.last().map(|w| w.code))
    }

    pub fn bound_handles(&self) -> Vec<DeviceHandle> {
        self.state.lock().map(|s| s.bound.clone()).unwrap_or_default()
    }

    pub fn released_handles(&self) -> Vec<DeviceHandle> {
        self.state.lock().map(|s| s.released.clone()).unwrap_or_default()
    }
}

impl DaqBackend for SimulatedDaq {
    fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok((0..self.device_count)
            .map(|i| DeviceDescriptor {
                product_name: "SIM-DAQ 1208".to_string(),
                unique_id: format!("SIM{:04}", i),
            })
            .collect())
    }

    fn bind(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle> {
        if self.fail_bind {
            return Err(anyhow!("unable to create device {}", descriptor.unique_id));
        }
        let mut state = self.state.lock().map_err(|_| anyhow!("simulated device state poisoned"))?;
        let handle = DeviceHandle(state.next_board);
        state.next_board += 1;
        state.bound.push(handle);
        Ok(handle)
    }

    fn release(&self, handle: DeviceHandle) {
        match self.state.lock() {
            Ok(mut state) => {
                if state.released.contains(&handle) {
                    warn!("Board {} released twice", handle.0);
                }
                state.released.push(handle);
            }
            Err(e) => error!("Failed to record release: {}", e),
        }
    }

    fn write_analog_output(&self, handle: DeviceHandle, channel: u32, range_code: u32, code: u16) -> Result<()> {
        let limit = *self.fail_after.lock().map_err(|_| anyhow!("fault injection state poisoned"))?;
        if let Some(limit) = limit {
            if self.successful_writes.load(Ordering::SeqCst) >= limit {
                return Err(anyhow!("board {} did not acknowledge write of code {}", handle.0, code));
            }
        }
        let mut state = self.state.lock().map_err(|_| anyhow!("simulated device state poisoned"))?;
        if !state.bound.contains(&handle) || state.released.contains(&handle) {
            return Err(anyhow!("board {} is not bound", handle.0));
        }
        state.writes.push(WriteRecord { channel, range_code, code });
        self.successful_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_lists_configured_devices() {
        let daq = SimulatedDaq::new(2);
        let devices = daq.discover().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].unique_id, "SIM0001");
        assert!(SimulatedDaq::new(0).discover().unwrap().is_empty());
    }

    #[test]
    fn test_session_releases_once_on_drop() {
        let daq = Arc::new(SimulatedDaq::new(1));
        let descriptor = daq.discover().unwrap().remove(0);
        {
            let mut session = DeviceSession::bind(daq.clone(), descriptor).unwrap();
            session.write(1, 4, 100).unwrap();
            session.release();
            assert!(session.write(1, 4, 101).is_err());
        }
        assert_eq!(daq.released_handles(), vec![DeviceHandle(0)]);
        assert_eq!(daq.writes(), vec![WriteRecord { channel: 1, range_code: 4, code: 100 }]);
    }

    #[test]
    fn test_failing_bind() {
        let daq = Arc::new(SimulatedDaq::new(1).with_failing_bind());
        let descriptor = daq.discover().unwrap().remove(0);
        assert!(DeviceSession::bind(daq.clone(), descriptor).is_err());
        assert!(daq.released_handles().is_empty());
    }

    #[test]
    fn test_fault_injection() {
        let daq = Arc::new(SimulatedDaq::new(1));
        let descriptor = daq.discover().unwrap().remove(0);
        let session = DeviceSession::bind(daq.clone(), descriptor).unwrap();
        daq.fail_after(2);
        assert!(session.write(1, 4, 1).is_ok());
        assert!(session.write(1, 4, 2).is_ok());
        assert!(session.write(1, 4, 3).is_err());
        assert_eq!(daq.last_code(), Some(2));
    }
}
