//! Pending-command queues.
//!
//! Two arrays of outgoing messages, bulk (indexed by opcode) and
//! control. Setters mutate a message in place and mark it pending;
//! marking is idempotent, repeated mutations before a flush coalesce
//! into one write. The acquisition thread flushes both arrays once per
//! loop pass.

use crate::messages::{BeginCommand, BulkCommand, ControlCommand, Frame};
use crate::protocol::{BULK_COUNT, BulkCode, CONTROL_BEGINCOMMAND};
use crate::transport::{DsoTransport, TransportError};

struct BulkSlot {
    cmd: BulkCommand,
    pending: bool,
}

struct ControlSlot {
    cmd: ControlCommand,
    code: u8,
    pending: bool,
}

/// Queues of pending outgoing messages.
pub struct CommandQueues {
    bulk: Vec<Option<BulkSlot>>,
    control: Vec<ControlSlot>,
    begin: BeginCommand,
}

impl CommandQueues {
    pub fn new() -> CommandQueues {
        let mut bulk = Vec::with_capacity(BULK_COUNT);
        bulk.resize_with(BULK_COUNT, || None);
        CommandQueues {
            bulk,
            control: Vec::new(),
            begin: BeginCommand::new(),
        }
    }

    /// Install a bulk command in its opcode slot.
    pub fn install_bulk(&mut self, code: BulkCode, cmd: BulkCommand, pending: bool) {
        self.bulk[code.index()] = Some(BulkSlot { cmd, pending });
    }

    /// Install a control command.
    pub fn install_control(&mut self, code: u8, cmd: ControlCommand, pending: bool) {
        self.control.push(ControlSlot { cmd, code, pending });
    }

    /// Whether a bulk slot is installed for this model.
    pub fn has_bulk(&self, code: BulkCode) -> bool {
        self.bulk[code.index()].is_some()
    }

    /// Apply `mutate` to the bulk command in `code`'s slot and mark it
    /// pending. Returns false when the slot is not installed.
    pub fn set_bulk(&mut self, code: BulkCode, mutate: impl FnOnce(&mut BulkCommand)) -> bool {
        match &mut self.bulk[code.index()] {
            Some(slot) => {
                mutate(&mut slot.cmd);
                slot.pending = true;
                true
            }
            None => false,
        }
    }

    /// Mark a bulk command pending without mutating it.
    pub fn mark_bulk(&mut self, code: BulkCode) -> bool {
        self.set_bulk(code, |_| {})
    }

    /// Apply `mutate` to the control command with `code` and mark it
    /// pending.
    pub fn set_control(&mut self, code: u8, mutate: impl FnOnce(&mut ControlCommand)) -> bool {
        match self.control.iter_mut().find(|slot| slot.code == code) {
            Some(slot) => {
                mutate(&mut slot.cmd);
                slot.pending = true;
                true
            }
            None => false,
        }
    }

    /// Read access to a bulk command, for tests and diagnostics.
    pub fn bulk_bytes(&self, code: BulkCode) -> Option<&[u8]> {
        self.bulk[code.index()].as_ref().map(|slot| slot.cmd.bytes())
    }

    pub fn bulk_pending(&self, code: BulkCode) -> bool {
        self.bulk[code.index()]
            .as_ref()
            .map(|slot| slot.pending)
            .unwrap_or(false)
    }

    pub fn control_pending(&self, code: u8) -> bool {
        self.control
            .iter()
            .find(|slot| slot.code == code)
            .map(|slot| slot.pending)
            .unwrap_or(false)
    }

    pub fn control_bytes(&self, code: u8) -> Option<&[u8]> {
        self.control
            .iter()
            .find(|slot| slot.code == code)
            .map(|slot| slot.cmd.bytes())
    }

    /// Mark every installed command pending, used once at connect to
    /// push the initial configuration.
    pub fn mark_all_pending(&mut self) {
        for slot in self.bulk.iter_mut().flatten() {
            slot.pending = true;
        }
        for slot in &mut self.control {
            slot.pending = true;
        }
    }

    /// Drop all installed commands.
    pub fn clear(&mut self) {
        for slot in &mut self.bulk {
            *slot = None;
        }
        self.control.clear();
    }

    /// Issue every pending message. Bulk messages go first, each
    /// prefixed by the BeginCommand control write the device uses as
    /// transaction boundary; control messages follow. Successful writes
    /// clear the pending flag; recoverable transport errors are logged
    /// and the message stays pending for the next pass. Returns `Err`
    /// only for `NoDevice`.
    pub fn flush<T: DsoTransport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> std::result::Result<(), TransportError> {
        for slot in self.bulk.iter_mut().flatten() {
            if !slot.pending {
                continue;
            }
            log::trace!("sending bulk command {:02x?}", slot.cmd.bytes());
            let result = transport
                .control_write(CONTROL_BEGINCOMMAND, self.begin.bytes(), 0, 0)
                .and_then(|()| transport.bulk_write(slot.cmd.bytes()).map(|_| ()));
            match result {
                Ok(()) => slot.pending = false,
                Err(err) => {
                    log::warn!(
                        "sending bulk command {:#04x} failed: {}",
                        slot.cmd.bytes()[0],
                        err.name()
                    );
                    if err.is_fatal() {
                        return Err(err);
                    }
                }
            }
        }

        for slot in &mut self.control {
            if !slot.pending {
                continue;
            }
            log::trace!(
                "sending control command {:#04x} {:02x?}",
                slot.code,
                slot.cmd.bytes()
            );
            match transport.control_write(slot.code, slot.cmd.bytes(), 0, 0) {
                Ok(()) => slot.pending = false,
                Err(err) => {
                    log::warn!("sending control command {:#04x} failed: {}", slot.code, err.name());
                    if err.is_fatal() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for CommandQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CaptureStart, SetGain, SetOffset, SetRelays};
    use crate::protocol::{CONTROL_SETOFFSET, CONTROL_SETRELAYS};
    use crate::transport::mock::MockTransport;

    fn queues_with_gain() -> CommandQueues {
        let mut queues = CommandQueues::new();
        queues.install_bulk(BulkCode::SetGain, BulkCommand::SetGain(SetGain::new()), false);
        queues.install_bulk(
            BulkCode::CaptureStart,
            BulkCommand::CaptureStart(CaptureStart::new()),
            false,
        );
        queues.install_control(
            CONTROL_SETOFFSET,
            ControlCommand::SetOffset(SetOffset::new()),
            false,
        );
        queues.install_control(
            CONTROL_SETRELAYS,
            ControlCommand::SetRelays(SetRelays::new()),
            false,
        );
        queues
    }

    #[test]
    fn set_bulk_marks_pending() {
        let mut queues = queues_with_gain();
        assert!(!queues.bulk_pending(BulkCode::SetGain));
        let ok = queues.set_bulk(BulkCode::SetGain, |cmd| {
            cmd.as_set_gain().unwrap().set_gain(0, 2);
        });
        assert!(ok);
        assert!(queues.bulk_pending(BulkCode::SetGain));
        assert_eq!(queues.bulk_bytes(BulkCode::SetGain).unwrap()[2], 0x02);
    }

    #[test]
    fn set_bulk_missing_slot_returns_false() {
        let mut queues = queues_with_gain();
        assert!(!queues.set_bulk(BulkCode::FSetBuffer, |_| {}));
        assert!(!queues.has_bulk(BulkCode::FSetBuffer));
    }

    #[test]
    fn marking_is_idempotent() {
        let mut queues = queues_with_gain();
        queues.mark_bulk(BulkCode::SetGain);
        queues.mark_bulk(BulkCode::SetGain);
        let mock = MockTransport::new(512);
        queues.flush(&mock).unwrap();
        // One bulk write despite two markings.
        assert_eq!(mock.bulk_opcodes(), vec![0x07]);
    }

    #[test]
    fn flush_prefixes_each_bulk_with_begin_command() {
        let mut queues = queues_with_gain();
        queues.mark_bulk(BulkCode::SetGain);
        queues.mark_bulk(BulkCode::CaptureStart);
        queues.set_control(CONTROL_SETRELAYS, |_| {});

        let mock = MockTransport::new(512);
        queues.flush(&mock).unwrap();

        // Two bulk writes, each preceded by a BeginCommand control write,
        // then the relay control write.
        assert_eq!(mock.bulk_opcodes(), vec![0x03, 0x07]);
        let controls = mock.control_writes.lock().unwrap();
        assert_eq!(controls.len(), 3);
        assert_eq!(controls[0].0, CONTROL_BEGINCOMMAND);
        assert_eq!(controls[1].0, CONTROL_BEGINCOMMAND);
        assert_eq!(controls[2].0, CONTROL_SETRELAYS);
        assert_eq!(controls[0].3[..2], [0x0F, 0x03]);
    }

    #[test]
    fn flush_clears_pending_on_success() {
        let mut queues = queues_with_gain();
        queues.mark_bulk(BulkCode::SetGain);
        let mock = MockTransport::new(512);
        queues.flush(&mock).unwrap();
        assert!(!queues.bulk_pending(BulkCode::SetGain));
        // A second flush writes nothing.
        queues.flush(&mock).unwrap();
        assert_eq!(mock.bulk_opcodes().len(), 1);
    }

    #[test]
    fn flush_aborts_on_no_device() {
        let mut queues = queues_with_gain();
        queues.mark_bulk(BulkCode::SetGain);
        let mock = MockTransport::new(512);
        mock.shutdown();
        assert_eq!(queues.flush(&mock), Err(TransportError::NoDevice));
        // Still pending for a hypothetical retry.
        assert!(queues.bulk_pending(BulkCode::SetGain));
    }

    #[test]
    fn mark_all_pending_covers_everything() {
        let mut queues = queues_with_gain();
        queues.mark_all_pending();
        assert!(queues.bulk_pending(BulkCode::SetGain));
        assert!(queues.bulk_pending(BulkCode::CaptureStart));
        assert!(queues.control_pending(CONTROL_SETOFFSET));
        assert!(queues.control_pending(CONTROL_SETRELAYS));
    }
}
