//! H.264 Annex B helpers.

/// NAL unit types that matter for stream start-up.
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Split an Annex B byte stream at its start codes (00 00 01 or 00 00 00 01).
/// Each item is one NAL unit without its start code.
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(idx + 1) {
            Some(&next) => next - 3,
            None => data.len(),
        };
        // A four-byte start code leaves one extra zero behind.
        while end > start && data[end - 1] == 0 && starts.get(idx + 1).is_some() {
            end -= 1;
        }
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// True if the access unit carries an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    nal_units(data)
        .into_iter()
        .any(|nal| nal_type(nal) == Some(NAL_IDR))
}
