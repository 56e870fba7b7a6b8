use usbd_msc::subclass::scsi::{BlockDevice, BlockDeviceError, ScsiCommand};

pub const BLOCK_SIZE: usize = 512;

const UNKNOWN: u8 = 0xFF;
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const MODE_SENSE_10: u8 = 0x5A;
const READ_10: u8 = 0x28;
const READ_CAPACITY_10: u8 = 0x25;
const READ_CAPACITY_16: u8 = 0x9E;
const WRITE_10: u8 = 0x2A;
const VERIFY_10: u8 = 0x2F;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;
const READ_FORMAT_CAPACITIES: u8 = 0x23;

pub fn cmd_into_bytes(cmd: ScsiCommand) -> Vec<u8> {
    let mut bytes = vec![];
    match cmd {
        ScsiCommand::Inquiry {
            evpd,
            page_code,
            alloc_len,
        } => {
            bytes.push(INQUIRY);
            bytes.push(evpd as u8);
            bytes.push(page_code);
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::TestUnitReady => {
            bytes.extend_from_slice([TEST_UNIT_READY, 0, 0, 0, 0, 0].as_slice());
        }
        ScsiCommand::RequestSense { desc, alloc_len } => {
            bytes.push(REQUEST_SENSE);
            bytes.push(desc as u8);
            bytes.extend_from_slice([0; 2].as_slice());
            bytes.push(alloc_len);
            bytes.push(0);
        }
        ScsiCommand::ModeSense6 {
            dbd,
            page_control,
            page_code,
            subpage_code,
            alloc_len,
        } => {
            bytes.push(MODE_SENSE_6);
            bytes.push((dbd as u8) << 3);
            bytes.push(((page_control as u8) << 6) | (page_code & 0b00111111));
            bytes.push(subpage_code);
            bytes.push(alloc_len);
            bytes.push(0);
        }
        ScsiCommand::ModeSense10 {
            dbd,
            page_control,
            page_code,
            subpage_code,
            alloc_len,
        } => {
            bytes.push(MODE_SENSE_10);
            bytes.push((dbd as u8) << 3);
            bytes.push(((page_control as u8) << 6) | (page_code & 0b00111111));
            bytes.push(subpage_code);
            bytes.extend_from_slice([0; 3].as_slice());
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::StartStopUnit { load_eject, start } => {
            bytes.extend_from_slice([START_STOP_UNIT, 0, 0, 0].as_slice());
            bytes.push(((load_eject as u8) << 1) | start as u8);
            bytes.push(0);
        }
        ScsiCommand::PreventAllowMediumRemoval { prevent } => {
            bytes.extend_from_slice([PREVENT_ALLOW_MEDIUM_REMOVAL, 0, 0, 0].as_slice());
            bytes.push(prevent as u8);
            bytes.push(0);
        }
        ScsiCommand::ReadCapacity10 => {
            bytes.push(READ_CAPACITY_10);
            bytes.extend_from_slice([0; 9].as_slice());
        }
        ScsiCommand::ReadCapacity16 { alloc_len } => {
            bytes.push(READ_CAPACITY_16);
            bytes.push(0x10);
            bytes.extend_from_slice([0; 8].as_slice());
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.extend_from_slice([0; 2].as_slice());
        }
        ScsiCommand::Read { lba, len } => {
            bytes.push(READ_10);
            bytes.push(0);
            bytes.extend_from_slice((lba as u32).to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::Write { lba, len } => {
            bytes.push(WRITE_10);
            bytes.push(0);
            bytes.extend_from_slice((lba as u32).to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::Verify {
            lba,
            len,
            byte_check,
        } => {
            bytes.push(VERIFY_10);
            bytes.push((byte_check as u8) << 1);
            bytes.extend_from_slice((lba as u32).to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::SynchronizeCache => {
            bytes.push(SYNCHRONIZE_CACHE_10);
            bytes.extend_from_slice([0; 9].as_slice());
        }
        ScsiCommand::ReadFormatCapacities { alloc_len } => {
            bytes.push(READ_FORMAT_CAPACITIES);
            bytes.extend_from_slice([0; 6].as_slice());
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        _ => {
            bytes.extend_from_slice([UNKNOWN, 0, 0, 0, 0, 0].as_slice());
        }
    }
    bytes
}

/// In-memory disk, block `n` initially filled with byte `n`
pub struct RamDisk {
    pub blocks: Vec<u8>,
    pub read_only: bool,
}

impl RamDisk {
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: (0..block_count * BLOCK_SIZE)
                .map(|i| (i / BLOCK_SIZE) as u8)
                .collect(),
            read_only: false,
        }
    }

    fn range(&self, lba: u64, len: usize) -> Result<std::ops::Range<usize>, BlockDeviceError> {
        let start = lba as usize * BLOCK_SIZE;
        if start + len > self.blocks.len() {
            return Err(BlockDeviceError);
        }
        Ok(start..start + len)
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> u32 {
        BLOCK_SIZE as u32
    }

    fn block_count(&self) -> u64 {
        (self.blocks.len() / BLOCK_SIZE) as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        let range = self.range(lba, buf.len())?;
        buf.copy_from_slice(&self.blocks[range]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<(), BlockDeviceError> {
        let range = self.range(lba, buf.len())?;
        self.blocks[range].copy_from_slice(buf);
        Ok(())
    }
}
