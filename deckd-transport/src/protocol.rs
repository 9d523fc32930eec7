//! Protocol constants and report framing for Stream Deck hardware
//!
//! Two feature-report command families exist (first generation and
//! everything after). Key images travel as a sequence of fixed-size output
//! reports ("image pages"), each starting with a model-specific header.

use crate::device_registry::{CommandSet, PageHeader};

/// Feature report command prefixes
pub mod cmd {
    pub const REV1_FIRMWARE: &[u8] = &[0x04];
    pub const REV1_RESET: &[u8] = &[0x0b, 0x63];
    pub const REV1_BRIGHTNESS: &[u8] = &[0x05, 0x55, 0xaa, 0xd1, 0x01];

    pub const REV2_FIRMWARE: &[u8] = &[0x05];
    pub const REV2_RESET: &[u8] = &[0x03, 0x02];
    pub const REV2_BRIGHTNESS: &[u8] = &[0x03, 0x08];

    /// Output report id used by all image writes
    pub const IMAGE_REPORT: u8 = 0x02;
    pub const KEY_IMAGE: u8 = 0x07;
    pub const LCD_IMAGE: u8 = 0x0c;
}

/// Timing constants
pub mod timing {
    /// Enumeration poll interval for the lifecycle loop
    pub const POLL_INTERVAL_MS: u64 = 250;
    /// Read timeout for the input loop (only bounds shutdown latency)
    pub const READ_TIMEOUT_MS: i32 = 100;
    /// Brightness fade step (30 Hz)
    pub const FADE_STEP_MS: u64 = 1000 / 30;
    /// Sleep after a failed read before the loop gives up on the device
    pub const ERROR_SLEEP_MS: u64 = 50;
}

/// LCD segment page header length
pub const LCD_HEADER_SIZE: usize = 16;

/// Maximum brightness percentage
pub const MAX_BRIGHTNESS: u8 = 100;

/// Device command carried in a feature report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureCommand {
    FirmwareVersion,
    Reset,
    /// Brightness percentage, clamped to 100
    Brightness(u8),
}

/// Build a zero-padded feature report for `command`
pub fn build_feature_report(set: CommandSet, command: FeatureCommand, report_size: usize) -> Vec<u8> {
    let (prefix, arg) = match (set, command) {
        (CommandSet::Rev1, FeatureCommand::FirmwareVersion) => (cmd::REV1_FIRMWARE, None),
        (CommandSet::Rev1, FeatureCommand::Reset) => (cmd::REV1_RESET, None),
        (CommandSet::Rev1, FeatureCommand::Brightness(p)) => (cmd::REV1_BRIGHTNESS, Some(p)),
        (CommandSet::Rev2, FeatureCommand::FirmwareVersion) => (cmd::REV2_FIRMWARE, None),
        (CommandSet::Rev2, FeatureCommand::Reset) => (cmd::REV2_RESET, None),
        (CommandSet::Rev2, FeatureCommand::Brightness(p)) => (cmd::REV2_BRIGHTNESS, Some(p)),
    };

    let mut buf = vec![0u8; report_size.max(prefix.len() + 1)];
    buf[..prefix.len()].copy_from_slice(prefix);
    if let Some(percent) = arg {
        buf[prefix.len()] = percent.min(MAX_BRIGHTNESS);
    }
    buf
}

/// Extract the firmware version string from a feature report
pub fn parse_firmware_version(report: &[u8], offset: usize) -> String {
    let raw = report.get(offset..).unwrap_or_default();
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

impl PageHeader {
    /// Build the header for one key image page
    ///
    /// `key` is the firmware key index (already translated).
    pub fn build(self, page: usize, key: u8, payload_len: usize, last: bool) -> Vec<u8> {
        let last = last as u8;
        match self {
            PageHeader::Rev1 => {
                let mut h = vec![cmd::IMAGE_REPORT, 0x01, (page + 1) as u8, 0x00, last, key + 1];
                h.resize(self.size(), 0);
                h
            }
            PageHeader::Mini => {
                let mut h = vec![cmd::IMAGE_REPORT, 0x01, page as u8, 0x00, last, key + 1];
                h.resize(self.size(), 0);
                h
            }
            PageHeader::Rev2 => {
                let len = (payload_len as u16).to_le_bytes();
                let page = (page as u16).to_le_bytes();
                vec![
                    cmd::IMAGE_REPORT,
                    cmd::KEY_IMAGE,
                    key,
                    last,
                    len[0],
                    len[1],
                    page[0],
                    page[1],
                ]
            }
        }
    }
}

/// Build the header for one page of an image headed to the key display
pub fn build_image_page_header(
    header: PageHeader,
    page_index: usize,
    position_index: u8,
    payload_len: usize,
    is_last: bool,
) -> Vec<u8> {
    header.build(page_index, position_index, payload_len, is_last)
}

/// Geometry of one LCD strip segment write
#[derive(Debug, Clone, Copy)]
pub struct LcdRegion {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Build the header for one page of an LCD segment image
pub fn build_lcd_page_header(
    region: LcdRegion,
    page_index: usize,
    payload_len: usize,
    is_last: bool,
) -> Vec<u8> {
    let mut h = Vec::with_capacity(LCD_HEADER_SIZE);
    h.push(cmd::IMAGE_REPORT);
    h.push(cmd::LCD_IMAGE);
    h.extend_from_slice(&region.x.to_le_bytes());
    h.extend_from_slice(&region.y.to_le_bytes());
    h.extend_from_slice(&region.width.to_le_bytes());
    h.extend_from_slice(&region.height.to_le_bytes());
    h.push(is_last as u8);
    h.extend_from_slice(&(page_index as u16).to_le_bytes());
    h.extend_from_slice(&(payload_len as u16).to_le_bytes());
    h.push(0x00);
    h
}

/// Paged view over an encoded image
#[derive(Debug, Clone, Copy)]
pub struct ImagePages<'a> {
    data: &'a [u8],
    page_size: usize,
}

impl<'a> ImagePages<'a> {
    pub fn new(data: &'a [u8], page_size: usize) -> Self {
        Self {
            data,
            page_size: page_size.max(1),
        }
    }

    /// Number of pages; an empty payload still occupies one (empty) page
    pub fn page_count(&self) -> usize {
        self.data.len().div_ceil(self.page_size).max(1)
    }

    /// Payload of page `index` and whether it is the final page
    pub fn page(&self, index: usize) -> (&'a [u8], bool) {
        let offset = index * self.page_size;
        if offset >= self.data.len() {
            return (&[], true);
        }
        let end = (offset + self.page_size).min(self.data.len());
        (&self.data[offset..end], index + 1 == self.page_count())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a [u8], bool)> + '_ {
        (0..self.page_count()).map(move |i| {
            let (payload, last) = self.page(i);
            (i, payload, last)
        })
    }
}

/// Frame an encoded image into complete output reports
///
/// Each report is `report_size` bytes: header from `header_for`, payload,
/// zero padding.
pub fn frame_reports<F>(
    data: &[u8],
    report_size: usize,
    header_size: usize,
    mut header_for: F,
) -> Vec<Vec<u8>>
where
    F: FnMut(usize, usize, bool) -> Vec<u8>,
{
    let pages = ImagePages::new(data, report_size - header_size);
    pages
        .iter()
        .map(|(index, payload, last)| {
            let mut report = vec![0u8; report_size];
            let header = header_for(index, payload.len(), last);
            report[..header.len()].copy_from_slice(&header);
            report[header.len()..header.len() + payload.len()].copy_from_slice(payload);
            report
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rev1_brightness_report() {
        let report = build_feature_report(CommandSet::Rev1, FeatureCommand::Brightness(50), 17);
        assert_eq!(report.len(), 17);
        assert_eq!(&report[..6], &[0x05, 0x55, 0xaa, 0xd1, 0x01, 50]);
        assert!(report[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_brightness_clamped() {
        let report = build_feature_report(CommandSet::Rev2, FeatureCommand::Brightness(250), 32);
        assert_eq!(&report[..3], &[0x03, 0x08, 100]);
        assert_eq!(report.len(), 32);
    }

    #[test]
    fn test_reset_and_firmware_reports() {
        let reset = build_feature_report(CommandSet::Rev1, FeatureCommand::Reset, 17);
        assert_eq!(&reset[..2], &[0x0b, 0x63]);
        let fw = build_feature_report(CommandSet::Rev2, FeatureCommand::FirmwareVersion, 32);
        assert_eq!(fw[0], 0x05);
        assert!(fw[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_firmware_version() {
        let mut report = vec![0u8; 32];
        report[0] = 0x05;
        report[6..12].copy_from_slice(b"1.02.3");
        assert_eq!(parse_firmware_version(&report, 6), "1.02.3");
        assert_eq!(parse_firmware_version(&report, 40), "");
    }

    #[test]
    fn test_rev1_header() {
        let h = build_image_page_header(PageHeader::Rev1, 0, 4, 100, false);
        assert_eq!(h.len(), 16);
        assert_eq!(&h[..6], &[0x02, 0x01, 0x01, 0x00, 0x00, 0x05]);
    }

    #[test]
    fn test_mini_header_page_not_offset() {
        let h = build_image_page_header(PageHeader::Mini, 2, 0, 100, true);
        assert_eq!(&h[..6], &[0x02, 0x01, 0x02, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_rev2_header() {
        let h = build_image_page_header(PageHeader::Rev2, 0x102, 7, 1016, true);
        assert_eq!(h, vec![0x02, 0x07, 7, 1, 0xf8, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_lcd_header() {
        let region = LcdRegion {
            x: 400,
            y: 0,
            width: 200,
            height: 100,
        };
        let h = build_lcd_page_header(region, 1, 500, true);
        assert_eq!(h.len(), LCD_HEADER_SIZE);
        assert_eq!(&h[..2], &[0x02, 0x0c]);
        assert_eq!(u16::from_le_bytes([h[2], h[3]]), 400);
        assert_eq!(u16::from_le_bytes([h[6], h[7]]), 200);
        assert_eq!(u16::from_le_bytes([h[8], h[9]]), 100);
        assert_eq!(h[10], 1);
        assert_eq!(u16::from_le_bytes([h[11], h[12]]), 1);
        assert_eq!(u16::from_le_bytes([h[13], h[14]]), 500);
    }

    #[test]
    fn test_page_count_matches_ceil() {
        for (len, size) in [(1usize, 1016usize), (1016, 1016), (1017, 1016), (15606, 7803), (3000, 1008)] {
            let data = vec![0xAB; len];
            let pages = ImagePages::new(&data, size);
            assert_eq!(pages.page_count(), len.div_ceil(size));

            let flags: Vec<bool> = pages.iter().map(|(_, _, last)| last).collect();
            assert_eq!(flags.iter().filter(|&&l| l).count(), 1);
            assert!(*flags.last().unwrap());

            let total: usize = pages.iter().map(|(_, p, _)| p.len()).sum();
            assert_eq!(total, len);
        }
    }

    #[test]
    fn test_empty_payload_single_last_page() {
        let pages = ImagePages::new(&[], 1016);
        assert_eq!(pages.page_count(), 1);
        assert_eq!(pages.page(0), (&[][..], true));
    }

    #[test]
    fn test_frame_reports_pads_every_report() {
        let data = vec![0x11; 2000];
        let reports = frame_reports(&data, 1024, 8, |page, len, last| {
            PageHeader::Rev2.build(page, 3, len, last)
        });
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.len() == 1024));
        assert_eq!(reports[0][3], 0);
        assert_eq!(reports[1][3], 1);
        // second page: 984 payload bytes then padding
        assert_eq!(reports[1][8 + 983], 0x11);
        assert_eq!(reports[1][8 + 984], 0x00);
    }
}
