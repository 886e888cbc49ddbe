//! Echo-cancellation reference routing
//!
//! Several listeners can ask for the playback reference on the shared
//! session. Only the first enable and the last disable reach the session;
//! re-routing to another playback device while enabled forces a re-enable.

use crate::engine::EngineError;
use crate::session::{CaptureSession, DeviceId, ListenerId};
use tracing::{debug, error};

#[derive(Debug, Default)]
pub struct EcRefTracker {
    count: u32,
    rx_device: Option<DeviceId>,
    using_external: bool,
}

impl EcRefTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn rx_device(&self) -> Option<DeviceId> {
        self.rx_device
    }

    /// Enable or disable the reference for `device`.
    ///
    /// `device_uses_external` is the resource manager's view of whether the
    /// device has external echo cancellation.
    pub fn set(
        &mut self,
        session: &dyn CaptureSession,
        listener: ListenerId,
        device: Option<DeviceId>,
        device_uses_external: bool,
        enable: bool,
        first_time: bool,
    ) -> Result<(), EngineError> {
        debug!(
            "EC ref count {}, enable {}, rx device {:?}, first time {}",
            self.count, enable, device, first_time
        );

        if enable {
            self.enable(session, listener, device, device_uses_external, first_time)
        } else {
            self.disable(session, listener, device)
        }
    }

    fn enable(
        &mut self,
        session: &dyn CaptureSession,
        listener: ListenerId,
        device: Option<DeviceId>,
        device_uses_external: bool,
        first_time: bool,
    ) -> Result<(), EngineError> {
        if self.using_external && !device_uses_external {
            error!("Internal EC cannot be set while external EC is active");
            return Err(EngineError::InvalidArgument(
                "internal EC requested while external EC is active".to_string(),
            ));
        }

        let mut force = false;
        if first_time {
            self.count += 1;
        } else if self.rx_device != device {
            force = true;
        } else {
            return Ok(());
        }

        if !force && self.count != 1 {
            return Ok(());
        }

        match session.set_ec_ref(listener, device, true) {
            Ok(()) => {
                self.using_external = device_uses_external;
                self.rx_device = device;
                debug!("EC ref enabled, count {}", self.count);
                Ok(())
            }
            Err(e) => {
                error!("Failed to set EC ref for rx device {:?}: {}", device, e);
                if first_time {
                    self.count -= 1;
                }
                if force || self.count == 0 {
                    self.rx_device = None;
                }
                Err(e.into())
            }
        }
    }

    fn disable(
        &mut self,
        session: &dyn CaptureSession,
        listener: ListenerId,
        device: Option<DeviceId>,
    ) -> Result<(), EngineError> {
        if device.is_some() && device != self.rx_device {
            debug!("Skipping EC disable, not for the routed device");
            return Ok(());
        }

        if self.count == 0 {
            debug!("Skipping EC disable, ref count is 0");
            return Ok(());
        }

        self.count -= 1;
        if self.count > 0 {
            return Ok(());
        }

        match session.set_ec_ref(listener, device, false) {
            Ok(()) => {
                self.rx_device = None;
                self.using_external = false;
                debug!("EC ref disabled");
                Ok(())
            }
            Err(e) => {
                error!("Failed to reset EC ref: {}", e);
                Err(e.into())
            }
        }
    }
}
