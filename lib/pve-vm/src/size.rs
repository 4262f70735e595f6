// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk sizes as reported by the hypervisor (`8G`, `512M`, `2T`).

use crate::Error;

/// Parses a remote disk size into whole gigabytes, rounding partial
/// gigabytes up.
pub fn parse_disk_size(raw: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidDiskSize { raw: raw.to_string() };

    let s = raw.trim();
    let unit = s.chars().last().ok_or_else(invalid)?;
    let number = &s[..s.len() - unit.len_utf8()];
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    let gigabytes = match unit {
        'T' => value * 1024.0,
        'G' => value,
        'M' => value / 1024.0,
        _ => return Err(invalid()),
    };
    let gigabytes = gigabytes.ceil();
    // 2^64 is the first value that does not fit.
    if gigabytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(gigabytes as u64)
}

/// Formats a gigabyte count the way the hypervisor and `qemu-img` expect.
pub fn format_disk_size(gigabytes: u64) -> String {
    format!("{}G", gigabytes)
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_CASES: &[(&str, Option<u64>)] = &[
        ("2T", Some(2048)),
        ("1024M", Some(1)),
        ("10G", Some(10)),
        ("1500M", Some(2)),
        ("1M", Some(1)),
        ("0.5T", Some(512)),
        ("32G ", Some(32)),
        ("5X", None),
        ("G", None),
        ("", None),
        ("12", None),
        ("-4G", None),
        ("99999999999999999999T", None),
        ("18014398509481984T", None),
        ("17179869184T", Some(17592186044416)),
    ];

    #[test]
    fn disk_sizes() {
        for (input, expected) in TEST_CASES {
            match (parse_disk_size(input), expected) {
                (Ok(gb), Some(want)) => assert_eq!(gb, *want, "{}", input),
                (Err(Error::InvalidDiskSize { raw }), None) => {
                    assert_eq!(raw, *input)
                }
                (res, _) => {
                    panic!("unexpected result {:?} for {:?}", res, input)
                }
            }
        }
    }

    #[test]
    fn formatting() {
        assert_eq!(format_disk_size(8), "8G");
        assert_eq!(parse_disk_size(&format_disk_size(42)).unwrap(), 42);
    }
}
