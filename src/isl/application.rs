use anyhow::{anyhow, bail};


/// Picks the `<count>x<toy>` entry with the highest count from a
///  comma-separated request line. Malformed entries are skipped; a line
///  without a single well-formed entry is the client's mistake and an error.
///  Ties keep the earliest entry.
pub fn most_copies(line: &[u8]) -> anyhow::Result<&[u8]> {
    let mut best: Option<(u64, &[u8])> = None;

    for entry in line.split(|&b| b == b',') {
        let entry = entry.trim_ascii();
        if entry.is_empty() {
            continue;
        }
        let Some(x_index) = entry.iter().position(|&b| b == b'x') else {
            continue;
        };
        if x_index == 0 || x_index == entry.len() - 1 {
            continue;
        }
        let Ok(count) = parse_count(&entry[..x_index]) else {
            continue;
        };

        match best {
            Some((best_count, _)) if count <= best_count => {}
            _ => best = Some((count, entry)),
        }
    }

    best.map(|(_, entry)| entry)
        .ok_or_else(|| anyhow!("no valid toy entry in request line"))
}

fn parse_count(digits: &[u8]) -> anyhow::Result<u64> {
    if digits.is_empty() {
        bail!("empty count");
    }
    let mut count: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            bail!("count contains non-digit bytes");
        }
        count = count
            .checked_mul(10)
            .and_then(|c| c.checked_add((b - b'0') as u64))
            .ok_or_else(|| anyhow!("count does not fit"))?;
    }
    Ok(count)
}
