use std::thread;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;

use crate::{
    BlockDevice, Error, Result, ScsiError, SenseData, TransportError, UsbCommunication,
    UsbMassStorageDeviceConfig,
};

const CBW_SIGNATURE: u32 = 0x4342_5355; // 'USBC'
const CSW_SIGNATURE: u32 = 0x5342_5355; // 'USBS'

const CBW_FLAG_DATA_IN: u8 = 0x80;

const CSW_STATUS_PASSED: u8 = 0;
const CSW_STATUS_FAILED: u8 = 1;
const CSW_STATUS_PHASE_ERROR: u8 = 2;

/// Bulk-Only Mass Storage Reset, sent to the interface between clearing the
/// endpoint halts during reset recovery.
const REQUEST_BULK_ONLY_RESET: u8 = 0xFF;
const REQUEST_TYPE_CLASS_INTERFACE: u8 = 0x21;

const OPCODE_TEST_UNIT_READY: u8 = 0x00;
const OPCODE_REQUEST_SENSE: u8 = 0x03;
const OPCODE_INQUIRY: u8 = 0x12;
const OPCODE_MODE_SENSE_6: u8 = 0x1A;
const OPCODE_READ_CAPACITY_10: u8 = 0x25;
const OPCODE_READ_10: u8 = 0x28;
const OPCODE_WRITE_10: u8 = 0x2A;

const MAX_NOT_READY_TRIES: u32 = 20;

/// Command Block Wrapper. Little-endian, 31 bytes on the wire.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
struct CommandBlockWrapper {
    signature: u32,
    tag: u32,
    data_transfer_length: u32,
    flags: u8,
    lun: u8,
    cb_length: u8,
    cb: [u8; 16],
}

const_assert!(core::mem::size_of::<CommandBlockWrapper>() == 31);

/// Command Status Wrapper. 13 bytes, closes every command.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
struct CommandStatusWrapper {
    signature: u32,
    tag: u32,
    data_residue: u32,
    status: u8,
}

const_assert!(core::mem::size_of::<CommandStatusWrapper>() == 13);

/// Block-addressed access to one logical unit of a USB mass storage device,
/// speaking SCSI over the Bulk-Only Transport.
pub struct ScsiBlockDevice<C> {
    comm: C,
    config: UsbMassStorageDeviceConfig,
    tag: u32,
    block_size: u32,
    last_block: u32,
}

impl<C: UsbCommunication> ScsiBlockDevice<C> {
    pub fn new(comm: C, config: UsbMassStorageDeviceConfig) -> Self {
        Self {
            comm,
            config,
            tag: 0,
            block_size: 0,
            last_block: 0,
        }
    }

    /// Brings the unit up: waits for it to become ready, checks that it is a
    /// direct-access device and caches its capacity.
    pub fn init(&mut self) -> Result<()> {
        for attempt in 0..MAX_NOT_READY_TRIES {
            match self.command(&[OPCODE_TEST_UNIT_READY, 0, 0, 0, 0, 0], None, None) {
                Ok(()) => break,
                Err(Error::Scsi(err)) => {
                    log::debug!("unit not ready (attempt {attempt}): {err}");
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) => return Err(err),
            }
        }

        let mut inquiry = [0u8; 36];
        self.command(
            &[OPCODE_INQUIRY, 0, 0, 0, inquiry.len() as u8, 0],
            Some(&mut inquiry),
            None,
        )?;
        let peripheral_qualifier = inquiry[0] >> 5;
        let peripheral_device_type = inquiry[0] & 0x1F;
        if peripheral_qualifier != 0 || peripheral_device_type != 0 {
            return Err(Error::Unsupported("not a direct-access device"));
        }

        let mut capacity = [0u8; 8];
        self.command(
            &[OPCODE_READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            Some(&mut capacity),
            None,
        )?;
        self.last_block = u32::from_be_bytes(capacity[0..4].try_into().unwrap());
        self.block_size = u32::from_be_bytes(capacity[4..8].try_into().unwrap());
        log::debug!(
            "capacity: {} blocks of {} bytes",
            u64::from(self.last_block) + 1,
            self.block_size
        );

        // Power condition mode page; not every stick implements it.
        let mut mode_sense = [0u8; 192];
        if let Err(err) = self.command(
            &[OPCODE_MODE_SENSE_6, 0, 0x1A, 0, mode_sense.len() as u8, 0],
            Some(&mut mode_sense),
            None,
        ) {
            log::debug!("MODE SENSE(6) not supported: {err}");
        }

        Ok(())
    }

    pub fn blocks(&self) -> u64 {
        u64::from(self.last_block) + 1
    }

    /// Runs one command, retrying once after reset recovery if the bulk
    /// pipe fails mid-command.
    fn command(
        &mut self,
        cb: &[u8],
        mut data_in: Option<&mut [u8]>,
        data_out: Option<&[u8]>,
    ) -> Result<()> {
        match self.run_command(cb, data_in.as_deref_mut(), data_out) {
            Err(Error::Transport(err)) => {
                log::warn!("bulk transfer failed ({err}), running reset recovery");
                self.bulk_reset()?;
                self.run_command(cb, data_in.as_deref_mut(), data_out)
            }
            result => result,
        }
    }

    fn run_command(
        &mut self,
        cb: &[u8],
        data_in: Option<&mut [u8]>,
        data_out: Option<&[u8]>,
    ) -> Result<()> {
        assert!(cb.len() <= 16);

        let data_transfer_length = match (&data_in, data_out) {
            (Some(data), None) => data.len() as u32,
            (None, Some(data)) => data.len() as u32,
            (None, None) => 0,
            (Some(_), Some(_)) => unreachable!(),
        };

        self.tag = self.tag.wrapping_add(1);
        let mut wrapper = CommandBlockWrapper {
            signature: CBW_SIGNATURE,
            tag: self.tag,
            data_transfer_length,
            flags: if data_in.is_some() { CBW_FLAG_DATA_IN } else { 0 },
            lun: self.config.lun,
            cb_length: cb.len() as u8,
            cb: [0; 16],
        };
        wrapper.cb[..cb.len()].copy_from_slice(cb);

        let written = self
            .comm
            .bulk_out(bytemuck::bytes_of(&wrapper))
            .map_err(Error::Transport)?;
        if written != core::mem::size_of::<CommandBlockWrapper>() {
            return Err(Error::Transport(TransportError::ShortTransfer));
        }

        let mut requested_in = 0;
        if let Some(data) = data_out {
            let transferred = self.comm.bulk_out(data).map_err(Error::Transport)?;
            if transferred != data.len() {
                return Err(Error::Transport(TransportError::ShortTransfer));
            }
        } else if let Some(data) = data_in {
            requested_in = data.len();
            self.comm.bulk_in(data).map_err(Error::Transport)?;
        }

        let mut status = [0u8; 13];
        let received = self.comm.bulk_in(&mut status).map_err(Error::Transport)?;
        if received != status.len() {
            return Err(Error::Transport(TransportError::ShortTransfer));
        }
        let wrapper: CommandStatusWrapper = bytemuck::pod_read_unaligned(&status);

        if wrapper.signature != CSW_SIGNATURE {
            return Err(Error::Transport(TransportError::Protocol));
        }
        if wrapper.tag != self.tag {
            return Err(Error::Transport(TransportError::Protocol));
        }

        match wrapper.status {
            CSW_STATUS_PASSED => {
                if requested_in > 0 && wrapper.data_residue > 0 {
                    return Err(Error::Transport(TransportError::ShortTransfer));
                }
                Ok(())
            }
            CSW_STATUS_FAILED => {
                let sense = self.request_sense();
                Err(Error::Scsi(ScsiError {
                    status: CSW_STATUS_FAILED,
                    sense,
                }))
            }
            CSW_STATUS_PHASE_ERROR => {
                self.bulk_reset()?;
                Err(Error::Scsi(ScsiError {
                    status: CSW_STATUS_PHASE_ERROR,
                    sense: None,
                }))
            }
            _ => Err(Error::Transport(TransportError::Protocol)),
        }
    }

    /// Best-effort REQUEST SENSE after a failed command.
    fn request_sense(&mut self) -> Option<SenseData> {
        let mut sense = [0u8; 18];
        let cb = [OPCODE_REQUEST_SENSE, 0, 0, 0, sense.len() as u8, 0];
        match self.run_command(&cb, Some(&mut sense), None) {
            Ok(()) => Some(SenseData {
                key: sense[2] & 0x0F,
                asc: sense[12],
                ascq: sense[13],
            }),
            Err(err) => {
                log::debug!("REQUEST SENSE failed: {err}");
                None
            }
        }
    }

    /// Reset recovery: Bulk-Only Mass Storage Reset on the interface, then
    /// clear the halt condition on both bulk endpoints.
    fn bulk_reset(&mut self) -> Result<()> {
        self.comm
            .control_transfer(
                REQUEST_TYPE_CLASS_INTERFACE,
                REQUEST_BULK_ONLY_RESET,
                0,
                u16::from(self.config.interface_number),
                &mut [],
            )
            .map_err(Error::Transport)?;
        self.comm
            .clear_feature_halt(self.config.in_endpoint_address)
            .map_err(Error::Transport)?;
        self.comm
            .clear_feature_halt(self.config.out_endpoint_address)
            .map_err(Error::Transport)?;
        Ok(())
    }

    fn rw_command(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
        let lba = lba.to_be_bytes();
        let blocks = blocks.to_be_bytes();
        [
            opcode, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0,
        ]
    }
}

impl<C: UsbCommunication> BlockDevice for ScsiBlockDevice<C> {
    fn read(&mut self, device_offset: u64, dest: &mut [u8]) -> Result<()> {
        let block_size = u64::from(self.block_size);
        assert_eq!(device_offset % block_size, 0);
        assert_eq!(dest.len() as u64 % block_size, 0);
        if dest.is_empty() {
            return Ok(());
        }

        let lba = (device_offset / block_size) as u32;
        let blocks = (dest.len() as u64 / block_size) as u16;
        let cb = Self::rw_command(OPCODE_READ_10, lba, blocks);
        self.command(&cb, Some(dest), None)
    }

    fn write(&mut self, device_offset: u64, src: &[u8]) -> Result<()> {
        let block_size = u64::from(self.block_size);
        assert_eq!(device_offset % block_size, 0);
        assert_eq!(src.len() as u64 % block_size, 0);
        if src.is_empty() {
            return Ok(());
        }

        let lba = (device_offset / block_size) as u32;
        let blocks = (src.len() as u64 / block_size) as u16;
        let cb = Self::rw_command(OPCODE_WRITE_10, lba, blocks);
        self.command(&cb, None, Some(src))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}
