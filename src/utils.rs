use crate::{TraceRecord, catalog::parse_u64};

pub fn get_tqdm_style() -> anyhow::Result<indicatif::ProgressStyle> {
    Ok(indicatif::ProgressStyle::with_template(
            "{percent:>3}% |{wide_bar}| {pos}/{len} [{elapsed_precise}<{eta_precise}, {custom_per_sec}]",
        )?
        .with_key(
            "custom_per_sec",
            |s: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                let _ = write!(w, "{:.2} it/s", s.per_sec());
            },
        ).progress_chars("██ "))
}

// parse a text trace: one `pc [core]` per line, pc in hex or decimal, `#` for comments
pub fn parse_text_trace(content: &str) -> anyhow::Result<Vec<TraceRecord>> {
    let mut records = vec![];
    for (line_index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let pc = fields
            .next()
            .and_then(parse_u64)
            .ok_or_else(|| anyhow::anyhow!("line {}: invalid pc in {:?}", line_index + 1, line))?;
        let core = match fields.next() {
            Some(core) => core
                .parse()
                .map_err(|err| anyhow::anyhow!("line {}: invalid core: {}", line_index + 1, err))?,
            None => 0,
        };
        records.push(TraceRecord { pc, core });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_trace() {
        let records = parse_text_trace("# pc core\n0x401000 0\n4198404 1\n\n0x401008\n").unwrap();
        assert_eq!(
            records,
            [
                TraceRecord { pc: 0x401000, core: 0 },
                TraceRecord { pc: 0x401004, core: 1 },
                TraceRecord { pc: 0x401008, core: 0 },
            ]
        );
        assert!(parse_text_trace("0x401000 x\n").is_err());
        assert!(parse_text_trace("zz\n").is_err());
    }
}
