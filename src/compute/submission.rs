//! Submission and completion of the recorded sequence
//!
//! One command buffer goes to one queue with one fresh fence, and the host
//! blocks on that fence for a bounded time. The controller follows
//! `Recording -> Ended -> Submitted -> {Completed | TimedOut}` and never
//! retries a step.

use std::time::{Duration, Instant};

use ash::vk;

use crate::backend::device::{ComputeDevice, DeviceObject};
use crate::compute::scope::{ResourceScope, ScopeSlot};
use crate::error::{ForgeError, ForgeResult};

/// Lifecycle of the run's command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SubmissionState {
    Recording,
    Ended,
    Submitted,
    Completed,
    TimedOut,
}

impl SubmissionState {
    pub fn can_transition_to(self, next: SubmissionState) -> bool {
        matches!(
            (self, next),
            (SubmissionState::Recording, SubmissionState::Ended)
                | (SubmissionState::Ended, SubmissionState::Submitted)
                | (SubmissionState::Submitted, SubmissionState::Completed)
                | (SubmissionState::Submitted, SubmissionState::TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Completed | SubmissionState::TimedOut)
    }
}

/// Drives one recorded command buffer to completion
#[derive(Debug)]
pub struct SubmissionController {
    command_buffer: vk::CommandBuffer,
    state: SubmissionState,
    fence: Option<(vk::Fence, ScopeSlot)>,
    waited: Option<Duration>,
}

impl SubmissionController {
    /// Take over a command buffer that is still recording
    pub fn new(command_buffer: vk::CommandBuffer) -> Self {
        Self {
            command_buffer,
            state: SubmissionState::Recording,
            fence: None,
            waited: None,
        }
    }

    pub fn state(&self) -> SubmissionState {
        self.state
    }

    /// Host time spent blocked on the fence
    pub fn waited(&self) -> Option<Duration> {
        self.waited
    }

    fn transition(&mut self, next: SubmissionState) -> ForgeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ForgeError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("SubmissionController: {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Close the recording
    pub fn end<D: ComputeDevice + ?Sized>(&mut self, device: &D) -> ForgeResult<()> {
        if !self.state.can_transition_to(SubmissionState::Ended) {
            return self.transition(SubmissionState::Ended);
        }
        device
            .end_command_buffer(self.command_buffer)
            .map_err(ForgeError::RecordingFailed)?;
        self.transition(SubmissionState::Ended)
    }

    /// Submit with a freshly created fence
    pub fn submit<D: ComputeDevice + ?Sized>(
        &mut self,
        scope: &mut ResourceScope<'_, D>,
    ) -> ForgeResult<()> {
        if !self.state.can_transition_to(SubmissionState::Submitted) {
            return self.transition(SubmissionState::Submitted);
        }
        let device = scope.device();
        let fence = device
            .create_fence()
            .map_err(ForgeError::allocation("fence"))?;
        let slot = scope.adopt(DeviceObject::Fence(fence), "fence");
        self.fence = Some((fence, slot));

        device
            .queue_submit(self.command_buffer, fence)
            .map_err(ForgeError::SubmitFailed)?;
        tracing::info!("SubmissionController::submit: command buffer submitted");
        self.transition(SubmissionState::Submitted)
    }

    /// Block until the fence signals or `timeout` elapses
    ///
    /// The fence is destroyed once the wait resolves either way. On timeout
    /// the device is drained first so nothing in flight is destroyed.
    pub fn wait<D: ComputeDevice + ?Sized>(
        &mut self,
        scope: &mut ResourceScope<'_, D>,
        timeout: Duration,
    ) -> ForgeResult<()> {
        let Some((fence, slot)) = self.fence else {
            return self.transition(SubmissionState::Completed);
        };
        if self.state != SubmissionState::Submitted {
            return self.transition(SubmissionState::Completed);
        }
        let device = scope.device();

        let started = Instant::now();
        let waited = device.wait_for_fence(fence, timeout);
        self.waited = Some(started.elapsed());
        let signaled = match waited {
            Ok(signaled) => signaled,
            Err(e) => {
                tracing::error!("SubmissionController::wait: {}", e);
                self.drain(device);
                scope.release(slot);
                self.fence = None;
                return Err(e.into());
            }
        };

        if signaled {
            self.transition(SubmissionState::Completed)?;
            scope.release(slot);
            self.fence = None;
            tracing::info!(
                "SubmissionController::wait: fence signaled after {:?}",
                started.elapsed()
            );
            return Ok(());
        }

        self.transition(SubmissionState::TimedOut)?;
        tracing::error!(
            "SubmissionController::wait: fence not signaled within {:?} (status {})",
            timeout,
            vk::Result::TIMEOUT.as_raw()
        );
        self.drain(device);
        scope.release(slot);
        self.fence = None;
        Err(ForgeError::WaitTimedOut { timeout })
    }

    /// Let in-flight work finish before anything it uses is destroyed
    fn drain<D: ComputeDevice + ?Sized>(&self, device: &D) {
        if let Err(e) = device.wait_idle() {
            tracing::error!("SubmissionController: drain failed: {}", e);
        }
    }

    /// End, submit and wait in one go
    pub fn run<D: ComputeDevice + ?Sized>(
        &mut self,
        scope: &mut ResourceScope<'_, D>,
        timeout: Duration,
    ) -> ForgeResult<()> {
        self.end(scope.device())?;
        self.submit(scope)?;
        self.wait(scope, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareDevice;

    fn recording(
        device: &SoftwareDevice,
        scope: &mut ResourceScope<'_, SoftwareDevice>,
    ) -> vk::CommandBuffer {
        let pool = device.create_command_pool().unwrap();
        scope.adopt(DeviceObject::CommandPool(pool), "command pool");
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        cmd
    }

    #[test]
    fn test_valid_transitions() {
        use SubmissionState::*;
        assert!(Recording.can_transition_to(Ended));
        assert!(Ended.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Completed));
        assert!(Submitted.can_transition_to(TimedOut));
        assert!(!Recording.can_transition_to(Submitted));
        assert!(!TimedOut.can_transition_to(Submitted));
        assert!(!Completed.can_transition_to(Completed));
        assert!(TimedOut.is_terminal());
    }

    #[test]
    fn test_run_completes() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let cmd = recording(&device, &mut scope);

        let mut controller = SubmissionController::new(cmd);
        controller.run(&mut scope, Duration::from_secs(1)).unwrap();
        assert_eq!(controller.state(), SubmissionState::Completed);
        assert!(controller.waited().is_some());
        // Only the command pool is left; the fence went with the wait.
        assert_eq!(scope.labels(), vec!["command pool"]);
    }

    #[test]
    fn test_zero_timeout_on_unsignaled_fence() {
        let device = SoftwareDevice::new().with_completion_delay(Duration::from_millis(100));
        let mut scope = ResourceScope::new(&device);
        let cmd = recording(&device, &mut scope);

        let mut controller = SubmissionController::new(cmd);
        let err = controller.run(&mut scope, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ForgeError::WaitTimedOut { timeout } if timeout.is_zero()));
        assert_eq!(controller.state(), SubmissionState::TimedOut);

        drop(scope);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.stats().usage_errors, 0);
    }

    #[test]
    fn test_submit_before_end_is_rejected() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let cmd = recording(&device, &mut scope);

        let mut controller = SubmissionController::new(cmd);
        let err = controller.submit(&mut scope).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::InvalidStateTransition {
                from: SubmissionState::Recording,
                to: SubmissionState::Submitted
            }
        ));
        assert_eq!(device.call_count("vkQueueSubmit"), 0);
    }

    #[test]
    fn test_rejected_submission() {
        let device = SoftwareDevice::new().with_failure(
            "vkQueueSubmit",
            1,
            vk::Result::ERROR_DEVICE_LOST,
        );
        let mut scope = ResourceScope::new(&device);
        let cmd = recording(&device, &mut scope);

        let mut controller = SubmissionController::new(cmd);
        let err = controller.run(&mut scope, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ForgeError::SubmitFailed(e) if e.is_device_lost()));
        assert_eq!(controller.state(), SubmissionState::Ended);
        assert_eq!(err.status_code(), Some(vk::Result::ERROR_DEVICE_LOST.as_raw()));
    }

    #[test]
    fn test_failed_wait_drains_before_release() {
        let device = SoftwareDevice::new()
            .with_completion_delay(Duration::from_millis(20))
            .with_failure("vkWaitForFences", 1, vk::Result::ERROR_DEVICE_LOST);
        let mut scope = ResourceScope::new(&device);
        let cmd = recording(&device, &mut scope);

        let mut controller = SubmissionController::new(cmd);
        let err = controller.run(&mut scope, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ForgeError::Device(e) if e.is_device_lost()));
        assert_eq!(device.call_count("vkDeviceWaitIdle"), 1);

        drop(scope);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.stats().usage_errors, 0);
    }

    #[test]
    fn test_end_failure_is_a_recording_error() {
        let device = SoftwareDevice::new().with_failure(
            "vkEndCommandBuffer",
            1,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        );
        let mut scope = ResourceScope::new(&device);
        let cmd = recording(&device, &mut scope);

        let mut controller = SubmissionController::new(cmd);
        let err = controller.end(&device).unwrap_err();
        assert!(matches!(err, ForgeError::RecordingFailed(_)));
        assert_eq!(controller.state(), SubmissionState::Recording);
    }
}
