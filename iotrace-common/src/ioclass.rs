//! Differentiated-storage-services I/O classification buckets, carried in
//! `IoBody::io_class`. Bucket codes and the size-to-bucket mapping follow
//! the original tracer's `iotrace_trace_bio` classification exactly.

#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum IoClass {
    Unclassified = 0,
    Metadata = 1,
    DataDir = 7,
    DataFile4Kb = 11,
    DataFile16Kb = 12,
    DataFile64Kb = 13,
    DataFile256Kb = 14,
    DataFile1Mb = 15,
    DataFile4Mb = 16,
    DataFile16Mb = 17,
    DataFile64Mb = 18,
    DataFile256Mb = 19,
    DataFile1Gb = 20,
    DataFileBulk = 21,
    DataDirect = 22,
    Misc = 23,
}

impl IoClass {
    pub const fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Unclassified),
            1 => Some(Self::Metadata),
            7 => Some(Self::DataDir),
            11 => Some(Self::DataFile4Kb),
            12 => Some(Self::DataFile16Kb),
            13 => Some(Self::DataFile64Kb),
            14 => Some(Self::DataFile256Kb),
            15 => Some(Self::DataFile1Mb),
            16 => Some(Self::DataFile4Mb),
            17 => Some(Self::DataFile16Mb),
            18 => Some(Self::DataFile64Mb),
            19 => Some(Self::DataFile256Mb),
            20 => Some(Self::DataFile1Gb),
            21 => Some(Self::DataFileBulk),
            22 => Some(Self::DataDirect),
            23 => Some(Self::Misc),
            _ => None,
        }
    }

    /// True for the range that carries a per-file-size data bucket, i.e. the
    /// range that warrants a companion `fs_meta` lookup.
    pub const fn is_data_file_bucket(self) -> bool {
        matches!(
            self,
            Self::DataFile4Kb
                | Self::DataFile16Kb
                | Self::DataFile64Kb
                | Self::DataFile256Kb
                | Self::DataFile1Mb
                | Self::DataFile4Mb
                | Self::DataFile16Mb
                | Self::DataFile64Mb
                | Self::DataFile256Mb
                | Self::DataFile1Gb
                | Self::DataFileBulk
        )
    }
}

const DATA_FILE_BULK_THRESHOLD: u64 = 1 << 30; // 1 GiB

/// Map a file I/O size in bytes to its DSS data-file bucket. Buckets double
/// starting at 4 KiB (`DataFile4Kb`) up through 1 GiB (`DataFile1Gb`); sizes
/// beyond 1 GiB fall into `DataFileBulk`.
///
/// Derived from `ilog2(max(size, 1)) `-style bucketing: round `size - 1` up
/// to the next 4 KiB boundary, take its bit length, and rescale so 4 KiB
/// lands on `DataFile4Kb`.
pub fn classify_file_size_class(size: u64) -> IoClass {
    if size == 0 {
        return IoClass::DataFile4Kb;
    }
    if size > DATA_FILE_BULK_THRESHOLD {
        return IoClass::DataFileBulk;
    }
    let rounded = (size - 1) | 4095u64;
    let leading = rounded.leading_zeros();
    let tag = (64 - leading + 11) >> 1;
    IoClass::from_u16(tag as u16).unwrap_or(IoClass::DataFileBulk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_match_known_sizes() {
        assert_eq!(classify_file_size_class(4096), IoClass::DataFile4Kb);
        assert_eq!(classify_file_size_class(16384), IoClass::DataFile16Kb);
        assert_eq!(classify_file_size_class(65536), IoClass::DataFile64Kb);
        assert_eq!(classify_file_size_class(1 << 30), IoClass::DataFile1Gb);
    }

    #[test]
    fn oversize_is_bulk() {
        assert_eq!(classify_file_size_class((1 << 30) + 1), IoClass::DataFileBulk);
        assert_eq!(classify_file_size_class(u64::MAX), IoClass::DataFileBulk);
    }

    #[test]
    fn bucket_roundtrip() {
        for code in [0u16, 1, 7, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23] {
            assert!(IoClass::from_u16(code).is_some());
        }
        assert!(IoClass::from_u16(2).is_none());
    }

    #[test]
    fn is_data_file_bucket_range() {
        assert!(!IoClass::Unclassified.is_data_file_bucket());
        assert!(!IoClass::Metadata.is_data_file_bucket());
        assert!(IoClass::DataFile4Kb.is_data_file_bucket());
        assert!(IoClass::DataFileBulk.is_data_file_bucket());
        assert!(!IoClass::DataDirect.is_data_file_bucket());
    }
}
