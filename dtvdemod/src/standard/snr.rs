//! Raw-to-decibel SNR lookup tables.

/// DTMB channel-estimate SNR breakpoints, one per dB starting at 1 dB.
const DTMB_SNR_TABLE: [u32; 40] = [
    5, 6, 8, 10, 13, 16, 20, 25, 32, 40, 50, 63, 80, 100, 126, 159, 200, 252, 318, 400, 504, 634,
    798, 1005, 1265, 1592, 2005, 2524, 3177, 4000, 5036, 6340, 7981, 10048, 12649, 15924, 20047,
    25238, 31773, 40000,
];

/// Number of DTMB SNR buckets; also the value returned past the last breakpoint.
pub const DTMB_SNR_BUCKETS: u16 = DTMB_SNR_TABLE.len() as u16;

/// Map a DTMB channel-estimate SNR register value to dB (1..=40).
pub fn convert_snr(raw: u32) -> u16 {
    let mut bucket = 1;
    while bucket < DTMB_SNR_TABLE.len() {
        if raw <= DTMB_SNR_TABLE[bucket] {
            break;
        }
        bucket += 1;
    }
    bucket as u16
}

/// ATSC equaliser error power breakpoints.
const ATSC_SNR_TABLE: [u32; 56] = [
    0, 7, 9, 11, 14, 17, 22, 27, 34, 43, 54, 68, 86, 108, 136, 171, 215, 271, 341, 429, 540, 566,
    592, 620, 649, 680, 712, 746, 781, 818, 856, 896, 939, 983, 1029, 1078, 1182, 1237, 1237, 1296,
    1357, 1708, 2150, 2707, 3408, 4291, 5402, 6800, 8561, 10778, 13568, 16312, 17081, 18081, 19081,
    65536,
];

/// SNR in dB x10 for each ATSC breakpoint.
const ATSC_SNR_DB10_TABLE: [u16; 56] = [
    360, 350, 340, 330, 320, 310, 300, 290, 280, 270, 260, 250, 240, 230, 220, 210, 200, 190, 180,
    170, 160, 158, 156, 154, 152, 150, 148, 146, 144, 142, 140, 138, 136, 134, 132, 130, 128, 126,
    124, 122, 120, 110, 100, 90, 80, 70, 60, 50, 40, 30, 20, 12, 10, 4, 2, 0,
];

/// Bounded binary search: index of the last breakpoint not above `value`.
fn atsc_find(value: u32, table: &[u32]) -> usize {
    let mut start = 0;
    let mut len = table.len();
    let mut rounds = 0;
    while len > 1 && rounds < 10 {
        rounds += 1;
        let half = len / 2;
        let probe = table[start + half];
        if value > probe {
            start += half;
            len -= half;
        } else if value < probe {
            len = half;
        } else {
            start += half;
            break;
        }
    }
    start
}

/// ATSC SNR in dB x10 from the 16-bit error power register pair.
pub fn atsc_snr_db10(raw: u32) -> u16 {
    ATSC_SNR_DB10_TABLE[atsc_find(raw, &ATSC_SNR_TABLE)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_snr_bounds() {
        assert_eq!(convert_snr(0), 1);
        assert_eq!(convert_snr(6), 1);
        assert_eq!(convert_snr(7), 2);
        assert_eq!(convert_snr(40_000), 39);
        assert_eq!(convert_snr(40_001), DTMB_SNR_BUCKETS);
        assert_eq!(convert_snr(u32::MAX), DTMB_SNR_BUCKETS);
    }

    #[test]
    fn test_convert_snr_monotonic() {
        let mut last = 0;
        for raw in (0..50_000).step_by(37) {
            let snr = convert_snr(raw);
            assert!(snr >= last);
            assert_eq!(convert_snr(raw), snr);
            last = snr;
        }
    }

    #[test]
    fn test_atsc_snr_lookup() {
        assert_eq!(atsc_snr_db10(0), 360);
        assert_eq!(atsc_snr_db10(65536), 0);
        assert_eq!(atsc_snr_db10(540), 160);
        // Between 54 (26 dB) and 68 (25 dB) rounds to the lower breakpoint.
        assert_eq!(atsc_snr_db10(60), 260);
    }

    #[test]
    fn test_atsc_snr_decreases_with_error_power() {
        let mut last = u16::MAX;
        for raw in (0..70_000).step_by(101) {
            let snr = atsc_snr_db10(raw);
            assert!(snr <= last, "raw {} gave {} after {}", raw, snr, last);
            last = snr;
        }
    }
}
