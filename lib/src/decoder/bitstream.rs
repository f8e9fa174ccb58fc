//! Re-packaging of access units into the framing the decoder engine accepts.
use anyhow::{bail, ensure, Result};

static START_CODE: [u8; 4] = [0x0, 0x0, 0x0, 0x1];

/// Converts access units and configuration data between framing conventions.
///
/// After a successful `convert()`, the converted data is available through `convert_buffer()`
/// until the next call.
pub trait BitstreamConverter {
    fn convert(&mut self, data: &[u8]) -> Result<()>;
    fn convert_buffer(&self) -> &[u8];
    /// Configuration data in the target framing.
    fn extra_data(&self) -> &[u8];
}

/// Converts length-prefixed H.264 (`avcC`) to Annex B start codes.
pub struct AvcToAnnexB {
    nal_length_size: usize,
    extra_data: Vec<u8>,
    buffer: Vec<u8>,
}

fn read_u16(data: &[u8], pos: usize) -> Result<usize> {
    ensure!(pos + 2 <= data.len(), "truncated avcC record");
    Ok(u16::from_be_bytes([data[pos], data[pos + 1]]) as usize)
}

impl AvcToAnnexB {
    /// Parse an `avcC` configuration record.
    pub fn new(avcc: &[u8]) -> Result<Self> {
        ensure!(avcc.len() >= 7, "avcC record too short ({} bytes)", avcc.len());
        ensure!(avcc[0] == 1, "unsupported avcC version {}", avcc[0]);

        let nal_length_size = (avcc[4] & 0x3) as usize + 1;
        if nal_length_size == 3 {
            bail!("invalid NAL length size 3");
        }

        let mut extra_data = Vec::new();
        let mut pos = 5;
        // SPS count is in the low 5 bits, PPS count uses the whole byte.
        for mask in [0x1f, 0xff] {
            ensure!(pos < avcc.len(), "truncated avcC record");
            let count = avcc[pos] & mask;
            pos += 1;
            for _ in 0..count {
                let len = read_u16(avcc, pos)?;
                pos += 2;
                ensure!(len <= avcc.len() - pos, "truncated parameter set");
                extra_data.extend_from_slice(&START_CODE);
                extra_data.extend_from_slice(&avcc[pos..pos + len]);
                pos += len;
            }
        }

        Ok(AvcToAnnexB {
            nal_length_size,
            extra_data,
            buffer: Vec::new(),
        })
    }
}

impl BitstreamConverter for AvcToAnnexB {
    fn convert(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.clear();
        let mut pos = 0;
        while pos < data.len() {
            ensure!(
                self.nal_length_size <= data.len() - pos,
                "truncated NAL length at offset {}",
                pos
            );
            let len = data[pos..pos + self.nal_length_size]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            pos += self.nal_length_size;
            ensure!(
                len <= data.len() - pos,
                "NAL unit of {} bytes overflows access unit",
                len
            );
            self.buffer.extend_from_slice(&START_CODE);
            self.buffer.extend_from_slice(&data[pos..pos + len]);
            pos += len;
        }

        Ok(())
    }

    fn convert_buffer(&self) -> &[u8] {
        &self.buffer
    }

    fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AVCC: [u8; 19] = [
        0x01, 0x64, 0x00, 0x1f, 0xff, // version, profile, compat, level, 4-byte lengths
        0xe1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1f, // 1 SPS
        0x01, 0x00, 0x03, 0x68, 0xee, 0x3c, 0x80, // 1 PPS, followed by one stray byte
    ];

    #[test]
    fn test_extra_data() {
        let conv = AvcToAnnexB::new(&AVCC).unwrap();
        assert_eq!(
            conv.extra_data(),
            &[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xee, 0x3c]
        );
    }

    #[test]
    fn test_convert_access_unit() {
        let mut conv = AvcToAnnexB::new(&AVCC).unwrap();
        let au = [0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x41];
        conv.convert(&au).unwrap();
        assert_eq!(
            conv.convert_buffer(),
            &[0, 0, 0, 1, 0x65, 0x88, 0, 0, 0, 1, 0x41]
        );
    }

    #[test]
    fn test_malformed_input() {
        assert!(AvcToAnnexB::new(&[0, 0, 0]).is_err());
        assert!(AvcToAnnexB::new(&[0, 0x64, 0, 0x1f, 0xff, 0xe0, 0]).is_err());
        assert!(AvcToAnnexB::new(&AVCC[..10]).is_err());

        let mut conv = AvcToAnnexB::new(&AVCC).unwrap();
        assert!(conv.convert(&[0, 0, 0, 9, 0x65]).is_err());
        assert!(conv.convert(&[0, 0]).is_err());
    }

    #[test]
    fn test_huge_nal_length() {
        let mut conv = AvcToAnnexB::new(&AVCC).unwrap();
        let err = conv.convert(&[0xff, 0xff, 0xff, 0xff, 0x65]).unwrap_err();
        assert!(err.to_string().contains("overflows access unit"));
        // A valid unit after a rejected one converts normally.
        conv.convert(&[0, 0, 0, 1, 0x41]).unwrap();
        assert_eq!(conv.convert_buffer(), &[0, 0, 0, 1, 0x41]);
    }
}
