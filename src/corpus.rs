use std::path::Path;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use polars::prelude::*;

use crate::preprocess::preprocess;

/// One preprocessed sentence and its translation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentencePair {
    pub source: String,
    pub target: String,
}

/// Reads up to `num_examples` sentence pairs from `path`.
///
/// Plain files are tab separated, one pair per line, optionally followed by
/// further columns (e.g. attribution) which are ignored. Files with a
/// `.parquet` extension are read through their first two string columns.
pub fn read_pairs(path: impl AsRef<Path>, num_examples: usize, lower: bool) -> Result<Vec<SentencePair>> {
    let path = path.as_ref();

    let is_parquet = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));

    let frame = if is_parquet {
        LazyFrame::scan_parquet(path, ScanArgsParquet::default())
    } else {
        LazyCsvReader::new(path)
            .with_has_header(false)
            .with_separator(b'\t')
            .with_quote_char(None)
            .with_truncate_ragged_lines(true)
            .with_infer_schema_length(Some(0))
            .finish()
    }
    .with_context(|| format!("Could not open corpus {}", path.display()))?;

    let df = frame
        .limit(num_examples.try_into().unwrap_or(IdxSize::MAX))
        .collect()
        .with_context(|| format!("Could not read corpus {}", path.display()))?;

    let pairs = pairs_from_frame(&df, lower)?;
    info!("Read {} sentence pairs from {}", pairs.len(), path.display());

    Ok(pairs)
}

fn pairs_from_frame(df: &DataFrame, lower: bool) -> Result<Vec<SentencePair>> {
    let columns = df.get_columns();
    if columns.len() < 2 {
        bail!(
            "Corpus needs at least two columns, found {}",
            columns.len()
        );
    }

    let source = columns[0]
        .as_materialized_series()
        .str()
        .context("First corpus column is not text")?;
    let target = columns[1]
        .as_materialized_series()
        .str()
        .context("Second corpus column is not text")?;

    let mut pairs = Vec::with_capacity(df.height());
    for (row, (src, tgt)) in source.into_iter().zip(target.into_iter()).enumerate() {
        match (src, tgt) {
            (Some(src), Some(tgt)) => pairs.push(SentencePair {
                source: preprocess(src, lower),
                target: preprocess(tgt, lower),
            }),
            _ => warn!("Skipping corpus row {row}: missing translation"),
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use super::*;

    fn write_tsv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_tab_separated_pairs() {
        let file = write_tsv(
            "Go.\tVa !\tCC-BY 2.0 (France)\nWho?\tQui ?\tCC-BY 2.0 (France)\n\"Hi\", he said.\tSalut, dit-il.\tCC\n",
        );

        let pairs = read_pairs(file.path(), 10, true).unwrap();

        assert_eq!(
            pairs,
            vec![
                SentencePair { source: "go .".into(), target: "va !".into() },
                SentencePair { source: "who ?".into(), target: "qui ?".into() },
                SentencePair { source: "hi , he said .".into(), target: "salut , dit-il .".into() },
            ]
        );
    }

    #[test]
    fn keeps_only_the_first_examples() {
        let file = write_tsv("A.\tB.\tx\nC.\tD.\tx\nE.\tF.\tx\n");

        let pairs = read_pairs(file.path(), 2, false).unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].source, "C .");
    }

    #[test]
    fn reads_parquet_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.parquet");

        let mut df = df!(
            "en" => ["Run!", "Stop!"],
            "fr" => ["Cours !", "Arrête !"],
        )
        .unwrap();
        ParquetWriter::new(File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        let pairs = read_pairs(&path, 10, true).unwrap();

        assert_eq!(pairs[0], SentencePair { source: "run !".into(), target: "cours !".into() });
        assert_eq!(pairs[1].target, "arrête !");
    }

    #[test]
    fn rows_missing_a_side_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holes.parquet");

        let mut df = df!(
            "en" => [Some("Go."), Some("Hi."), None, Some("Run!")],
            "fr" => [Some("Va !"), None, Some("Salut."), Some("Cours !")],
        )
        .unwrap();
        ParquetWriter::new(File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        let pairs = read_pairs(&path, 10, true).unwrap();

        assert_eq!(
            pairs,
            vec![
                SentencePair { source: "go .".into(), target: "va !".into() },
                SentencePair { source: "run !".into(), target: "cours !".into() },
            ]
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(read_pairs("/definitely/not/here.txt", 10, true).is_err());
    }
}
