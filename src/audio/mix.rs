//! Summing mixer for 16-bit PCM
//!
//! Sources are summed rather than averaged so a single speaker keeps its
//! level. Sums saturate at the i16 range.

use crate::constants::SAMPLE_WIDTH;

/// Mix little-endian i16 payloads into one.
///
/// Payloads with an odd byte length are dropped, the rest are truncated to
/// the shortest one. Returns an empty buffer when nothing is left to mix.
pub fn mix<T: AsRef<[u8]>>(payloads: &[T]) -> Vec<u8> {
    let sources: Vec<&[u8]> = payloads
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.is_empty() && p.len() % SAMPLE_WIDTH == 0)
        .collect();

    let Some(samples) = sources.iter().map(|p| p.len() / SAMPLE_WIDTH).min() else {
        return Vec::new();
    };

    let mut acc = vec![0i32; samples];
    for source in &sources {
        for (sum, bytes) in acc.iter_mut().zip(source.chunks_exact(SAMPLE_WIDTH)) {
            *sum += i16::from_le_bytes([bytes[0], bytes[1]]) as i32;
        }
    }

    let mut out = Vec::with_capacity(samples * SAMPLE_WIDTH);
    for sum in acc {
        let clamped = sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }
    out
}

/// Encode samples as little-endian PCM
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian PCM; a trailing odd byte is ignored
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mix_empty() {
        let none: [&[u8]; 0] = [];
        assert!(mix(&none).is_empty());
    }

    #[test]
    fn test_mix_single_source_is_identity() {
        let pcm = samples_to_bytes(&[1, -2, 300, i16::MIN, i16::MAX]);
        assert_eq!(mix(&[pcm.clone()]), pcm);
    }

    #[test]
    fn test_mix_clamps_instead_of_wrapping() {
        let a = samples_to_bytes(&[30_000, -30_000]);
        let b = samples_to_bytes(&[10_000, -10_000]);
        assert_eq!(bytes_to_samples(&mix(&[a, b])), vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_mix_truncates_to_shortest() {
        let a = samples_to_bytes(&[1, 2, 3, 4]);
        let b = samples_to_bytes(&[10, 20]);
        assert_eq!(bytes_to_samples(&mix(&[a, b])), vec![11, 22]);
    }

    #[test]
    fn test_mix_drops_odd_length_payloads() {
        let good = samples_to_bytes(&[5, 6]);
        let bad = vec![1u8, 2, 3];
        assert_eq!(mix(&[good.clone(), bad.clone()]), good);
        assert!(mix(&[bad]).is_empty());
    }

    proptest! {
        #[test]
        fn prop_mix_is_clamped_sum(
            sources in prop::collection::vec(
                prop::collection::vec(any::<i16>(), 1..64),
                1..6,
            )
        ) {
            let payloads: Vec<Vec<u8>> = sources.iter().map(|s| samples_to_bytes(s)).collect();
            let mixed = bytes_to_samples(&mix(&payloads));

            let shortest = sources.iter().map(Vec::len).min().unwrap();
            prop_assert_eq!(mixed.len(), shortest);

            for (i, sample) in mixed.iter().enumerate() {
                let sum: i32 = sources.iter().map(|s| s[i] as i32).sum();
                let expected = sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                prop_assert_eq!(*sample, expected);
            }
        }
    }
}
