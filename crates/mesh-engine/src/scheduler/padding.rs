//! Dynamic padding of variable-length inputs

use mesh_core::{PaddingInfo, Payload, Request};

/// Pad every request to the longest input in the batch.
///
/// Only applies when all payloads are variable-length and of the same kind.
/// Returns `None` when nothing had to be padded.
pub fn pad_requests(
    requests: &mut [Request],
    pad_token: u32,
    pad_byte: u8,
) -> Option<PaddingInfo> {
    let first_kind = requests.first()?.payload.kind();
    if requests.iter().any(|r| r.payload.kind() != first_kind) {
        return None;
    }
    let lens: Vec<usize> = requests
        .iter()
        .map(|r| r.payload.seq_len())
        .collect::<Option<_>>()?;
    let padded_len = lens.iter().copied().max()?;
    if lens.iter().all(|len| *len == padded_len) {
        return None;
    }

    let original_lens = requests
        .iter_mut()
        .zip(lens)
        .map(|(request, len)| {
            if len < padded_len {
                request.payload.pad_to(padded_len, pad_token, pad_byte);
                Some(len)
            } else {
                None
            }
        })
        .collect();

    Some(PaddingInfo {
        padded_len,
        original_lens,
    })
}

/// Restore the original inputs, e.g. before a batch is requeued
pub fn unpad_requests(requests: &mut [Request], padding: &PaddingInfo) {
    for (request, original) in requests.iter_mut().zip(&padding.original_lens) {
        if let Some(len) = original {
            request.payload.truncate(*len);
        }
    }
}

/// Trim a backend output for item `index` back to its input length.
///
/// Outputs whose length differs from the padded length are left alone; the
/// backend has already produced something of its own shape.
pub fn unpad_output(output: &mut Payload, index: usize, padding: &PaddingInfo) {
    let Some(Some(len)) = padding.original_lens.get(index) else {
        return;
    };
    if output.seq_len() == Some(padding.padded_len) {
        output.truncate(*len);
    }
}
