use crate::config::{Encoding, TableConfig};
use crate::error::PipelineError;
use crate::types::{RawDistrictRow, ShareRow};
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

const CODE_WIDTHS: [usize; 3] = [2, 2, 4];

#[derive(Debug, Clone)]
pub struct Normalized {
    pub rows: Vec<ShareRow>,
    // (party, national share) in column order
    pub parties: Vec<(String, f64)>,
    pub zero_vote_districts: Vec<String>,
}

/// Concatenates the three code parts zero-padded to widths 2, 2 and 4.
pub fn district_id(region: u64, subregion: u64, local: u64) -> Result<String, PipelineError> {
    let mut id = String::with_capacity(8);
    for (value, width) in [region, subregion, local].into_iter().zip(CODE_WIDTHS) {
        let part = format!("{:0width$}", value, width = width);
        if part.len() > width {
            return Err(PipelineError::CodeOverflow { value, width });
        }
        id.push_str(&part);
    }
    Ok(id)
}

pub fn decode(bytes: Vec<u8>, encoding: Encoding) -> Result<String> {
    match encoding {
        Encoding::Utf8 => String::from_utf8(bytes).context("Vote table is not valid UTF-8"),
        Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

pub fn load_vote_table(path: &Path, config: &TableConfig) -> Result<Vec<RawDistrictRow>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read vote table {:?}", path))?;
    let text = decode(bytes, config.encoding)?;
    let rows = parse_vote_table(&text, config)
        .with_context(|| format!("Failed to parse vote table {:?}", path))?;
    tracing::info!("Loaded vote counts for {} districts", rows.len());
    Ok(rows)
}

pub fn parse_vote_table(text: &str, config: &TableConfig) -> Result<Vec<RawDistrictRow>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = rdr.headers()?.clone();

    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PipelineError::MissingColumn(name.to_string()))
    };
    let code_cols = [
        find(&config.region_column)?,
        find(&config.subregion_column)?,
        find(&config.local_column)?,
    ];

    let count_re = config.count_regex()?;
    let count_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| !code_cols.contains(i))
        .filter_map(|(i, h)| {
            count_re
                .captures(h)
                .and_then(|c| c.name("party"))
                .map(|m| (i, m.as_str().to_string()))
        })
        .collect();
    if count_cols.is_empty() {
        return Err(PipelineError::NoCountColumns.into());
    }

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        // header is line 1
        let row = i + 2;
        let record = result?;
        let field = |idx: usize| record.get(idx).unwrap_or("");
        let parse = |idx: usize| {
            field(idx).parse::<u64>().map_err(|_| PipelineError::MalformedRow {
                row,
                reason: format!("'{}' in column '{}' is not a count", field(idx), &headers[idx]),
            })
        };

        let id = district_id(parse(code_cols[0])?, parse(code_cols[1])?, parse(code_cols[2])?)?;
        if !seen.insert(id.clone()) {
            return Err(PipelineError::MalformedRow {
                row,
                reason: format!("district {} listed twice", id),
            }
            .into());
        }

        let counts = count_cols
            .iter()
            .map(|(idx, party)| Ok((party.clone(), parse(*idx)?)))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        rows.push(RawDistrictRow {
            district_id: id,
            counts,
        });
    }
    Ok(rows)
}

pub fn normalize(table: &[RawDistrictRow], excluded: &[String]) -> Normalized {
    let excluded: HashSet<&str> = excluded.iter().map(String::as_str).collect();

    let long: Vec<(&str, &str, u64)> = table
        .iter()
        .flat_map(|row| {
            row.counts
                .iter()
                .map(move |(party, count)| (row.district_id.as_str(), party.as_str(), *count))
        })
        .filter(|(_, party, _)| !excluded.contains(party))
        .collect();

    let mut district_totals: HashMap<&str, u64> = HashMap::new();
    let mut party_totals: HashMap<&str, u64> = HashMap::new();
    let mut party_order: Vec<&str> = Vec::new();
    for &(district, party, count) in &long {
        *district_totals.entry(district).or_default() += count;
        let total = party_totals.entry(party).or_insert_with(|| {
            party_order.push(party);
            0
        });
        *total += count;
    }
    let grand_total: u64 = party_totals.values().sum();

    let national = |party: &str| {
        if grand_total == 0 {
            f64::NAN
        } else {
            party_totals[party] as f64 / grand_total as f64
        }
    };

    let rows = long
        .iter()
        .map(|&(district, party, count)| {
            let total = district_totals[district];
            ShareRow {
                district_id: district.to_string(),
                party: party.to_string(),
                count,
                district_share: if total == 0 {
                    f64::NAN
                } else {
                    count as f64 / total as f64
                },
                national_share: national(party),
            }
        })
        .collect();

    let mut zero_vote_districts: Vec<String> = table
        .iter()
        .map(|row| row.district_id.as_str())
        .filter(|id| district_totals.get(id).copied().unwrap_or(0) == 0)
        .map(str::to_string)
        .collect();
    zero_vote_districts.dedup();

    let parties = party_order
        .into_iter()
        .map(|p| (p.to_string(), national(p)))
        .collect();

    Normalized {
        rows,
        parties,
        zero_vote_districts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const TABLE: &str = "\
LAN;KOM;VALDIST;Namn;S;S proc;M;M proc;OG;OG proc;ÖVR;ÖVR proc
1;80;1;Norr;300;60,0;150;30,0;20;4,0;30;6,0
01;80;2;Söder;100;25,0;300;75,0;0;0,0;0;0,0
25;3;117;Fjäll;0;0,0;0;0,0;4;100,0;0;0,0
";

    fn config() -> TableConfig {
        TableConfig {
            encoding: Encoding::Utf8,
            ..TableConfig::default()
        }
    }

    #[test]
    fn district_id_pads_each_part() {
        assert_eq!(district_id(1, 80, 1).unwrap(), "01800001");
        assert_eq!(district_id(25, 3, 117).unwrap(), "25030117");
    }

    #[test]
    fn district_id_rejects_wide_parts() {
        assert!(matches!(
            district_id(123, 1, 1),
            Err(PipelineError::CodeOverflow { value: 123, width: 2 })
        ));
        assert!(district_id(1, 1, 10_000).is_err());
    }

    #[test]
    fn parses_only_count_columns() {
        let rows = parse_vote_table(TABLE, &config()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].district_id, "01800001");
        let parties: Vec<&str> = rows[0].counts.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(parties, vec!["S", "M", "OG", "ÖVR"]);
        assert_eq!(rows[1].counts[1], ("M".to_string(), 300));
    }

    #[test]
    fn qualifier_is_stripped_from_party_names() {
        let text = "LAN;KOM;VALDIST;S röster;S proc\n1;1;1;10;100\n";
        let rows = parse_vote_table(text, &config()).unwrap();
        assert_eq!(rows[0].counts, vec![("S".to_string(), 10)]);
    }

    #[test]
    fn malformed_count_is_not_zero() {
        let text = "LAN;KOM;VALDIST;S\n1;1;1;\n";
        let err = parse_vote_table(text, &config()).unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::MalformedRow { row: 2, .. }));
    }

    #[test]
    fn missing_code_column_is_reported() {
        let text = "LAN;KOM;S\n1;1;1\n";
        let err = parse_vote_table(text, &config()).unwrap_err();
        assert!(err.to_string().contains("VALDIST"));
    }

    #[test]
    fn district_shares_sum_to_one() {
        let rows = parse_vote_table(TABLE, &config()).unwrap();
        let norm = normalize(&rows, &config().excluded_party_codes);

        assert!(norm.rows.iter().all(|r| r.party != "OG" && r.party != "ÖVR"));
        for id in ["01800001", "01800002"] {
            let sum: f64 = norm
                .rows
                .iter()
                .filter(|r| r.district_id == id)
                .map(|r| r.district_share)
                .sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
        let s = norm
            .rows
            .iter()
            .find(|r| r.district_id == "01800001" && r.party == "S")
            .unwrap();
        assert_abs_diff_eq!(s.district_share, 300.0 / 450.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_vote_district_is_flagged_as_nan() {
        let rows = parse_vote_table(TABLE, &config()).unwrap();
        let norm = normalize(&rows, &config().excluded_party_codes);

        assert_eq!(norm.zero_vote_districts, vec!["25030117".to_string()]);
        let flagged: Vec<&ShareRow> = norm
            .rows
            .iter()
            .filter(|r| r.district_id == "25030117")
            .collect();
        assert_eq!(flagged.len(), 2);
        assert!(flagged.iter().all(|r| r.district_share.is_nan()));
    }

    #[test]
    fn national_share_is_constant_per_party_and_sums_to_one() {
        let rows = parse_vote_table(TABLE, &config()).unwrap();
        let norm = normalize(&rows, &config().excluded_party_codes);

        for (party, share) in &norm.parties {
            assert!(norm
                .rows
                .iter()
                .filter(|r| &r.party == party)
                .all(|r| r.national_share == *share));
        }
        let total: f64 = norm.parties.iter().map(|(_, s)| s).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        assert_eq!(norm.parties[0].0, "S");
        assert_abs_diff_eq!(norm.parties[0].1, 400.0 / 850.0, epsilon = 1e-12);
    }

    #[test]
    fn latin1_bytes_decode() {
        let bytes = vec![b'\xd6', b'V', b'R'];
        assert_eq!(decode(bytes, Encoding::Latin1).unwrap(), "ÖVR");
    }
}
