//! Metadata loaders, selected by name with `--loader-name`.
//!
//! Every loader reads `|`-delimited, headerless metadata files and returns the records in file
//! order. The language of a record is the name of the directory its `meta.csv` lives in, and audio
//! paths are returned relative to the dataset directory.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use csv::StringRecord;
use phf::phf_map;
use serde::Deserialize;

/// One recording described by the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub text: String,
    /// Relative to the dataset directory, always with `/` separators.
    pub audio_path: String,
    pub speaker_id: String,
    pub language: String,
}

pub type LoaderFn = fn(&Path, &[PathBuf]) -> Result<Vec<Record>>;

pub const LOADERS: phf::Map<&'static str, LoaderFn> = phf_map! {
    "my_common_voice" => my_common_voice as LoaderFn,
    "css10" => css10 as LoaderFn,
    "ljspeech" => ljspeech as LoaderFn,
};

pub fn get_loader_by_name(name: &str) -> Result<LoaderFn> {
    LOADERS.get(name).copied().ok_or_else(|| {
        let mut known: Vec<_> = LOADERS.keys().copied().collect();
        known.sort_unstable();
        anyhow!("unknown loader '{}', expected one of: {}", name, known.join(", "))
    })
}

#[derive(Debug, Deserialize)]
struct CommonVoiceRow {
    speaker_id: String,
    audio_file: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct Css10Row {
    audio_file: String,
    _original_text: String,
    normalized_text: String,
    _duration: f32,
}

#[derive(Debug, Deserialize)]
struct LjSpeechRow {
    id: String,
    _text: String,
    normalized_text: String,
}

/// Column count of a metadata format. With `text_tail` the last column is the transcript and any
/// further `|` on the line belongs to it.
#[derive(Debug, Clone, Copy)]
struct RowLayout {
    fields: usize,
    text_tail: bool,
}

/// `speaker_id|audio_file|text`, audio relative to the language directory. The text may contain `|`.
pub fn my_common_voice(root: &Path, meta_files: &[PathBuf]) -> Result<Vec<Record>> {
    let layout = RowLayout { fields: 3, text_tail: true };
    load_rows(root, meta_files, layout, |row: CommonVoiceRow, lang, prefix| Record {
        text: row.text,
        audio_path: join_relative(prefix, &row.audio_file),
        speaker_id: row.speaker_id.trim().to_string(),
        language: lang.to_string(),
    })
}

/// `audio_file|original_text|normalized_text|duration`, one speaker per language.
pub fn css10(root: &Path, meta_files: &[PathBuf]) -> Result<Vec<Record>> {
    let layout = RowLayout { fields: 4, text_tail: false };
    load_rows(root, meta_files, layout, |row: Css10Row, lang, prefix| Record {
        text: row.normalized_text,
        audio_path: join_relative(prefix, &row.audio_file),
        speaker_id: format!("css10_{}", lang),
        language: lang.to_string(),
    })
}

/// `id|text|normalized_text` with the audio in `wavs/<id>.wav`, a single speaker.
pub fn ljspeech(root: &Path, meta_files: &[PathBuf]) -> Result<Vec<Record>> {
    let layout = RowLayout { fields: 3, text_tail: false };
    load_rows(root, meta_files, layout, |row: LjSpeechRow, lang, prefix| Record {
        text: row.normalized_text,
        audio_path: join_relative(prefix, &format!("wavs/{}.wav", row.id.trim())),
        speaker_id: "ljspeech".to_string(),
        language: lang.to_string(),
    })
}

fn load_rows<T, F>(root: &Path, meta_files: &[PathBuf], layout: RowLayout, to_record: F) -> Result<Vec<Record>>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(T, &str, &str) -> Record,
{
    let mut records = Vec::new();
    for meta_path in meta_files {
        let lang_dir = meta_path
            .parent()
            .with_context(|| format!("metadata file '{}' has no parent directory", meta_path.display()))?;
        let language = lang_dir
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("cannot derive a language from '{}'", meta_path.display()))?;
        let prefix = relative_prefix(root, lang_dir)?;

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .from_path(meta_path)
            .with_context(|| format!("failed to open metadata file: {}", meta_path.display()))?;

        for (line, raw) in rdr.records().enumerate() {
            let location = || format!("{}:{}: malformed metadata row", meta_path.display(), line + 1);
            let fields = raw
                .map_err(anyhow::Error::from)
                .and_then(|raw| fit_to_layout(raw, layout))
                .with_context(location)?;
            let row: T = fields.deserialize(None).with_context(location)?;
            records.push(to_record(row, language, &prefix));
        }
    }
    Ok(records)
}

/// Rejoins the overflow of a `text_tail` row into its last column. Every other count mismatch is an
/// error, whichever line it is on.
fn fit_to_layout(raw: StringRecord, layout: RowLayout) -> Result<StringRecord> {
    if raw.len() == layout.fields {
        return Ok(raw);
    }
    if !layout.text_tail || raw.len() < layout.fields {
        bail!("expected {} fields, found {}", layout.fields, raw.len());
    }
    let mut row: StringRecord = raw.iter().take(layout.fields - 1).collect();
    let text: Vec<&str> = raw.iter().skip(layout.fields - 1).collect();
    row.push_field(&text.join("|"));
    Ok(row)
}

/// The language directory relative to the dataset root, `/`-separated.
fn relative_prefix(root: &Path, lang_dir: &Path) -> Result<String> {
    let rel = lang_dir.strip_prefix(root).with_context(|| {
        format!("'{}' is not inside the dataset directory '{}'", lang_dir.display(), root.display())
    })?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    Ok(parts.join("/"))
}

fn join_relative(prefix: &str, file: &str) -> String {
    let file = file.trim();
    if prefix.is_empty() { file.to_string() } else { format!("{}/{}", prefix, file) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_meta(root: &Path, lang: &str, content: &str) -> PathBuf {
        let dir = root.join(lang);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("meta.csv");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn common_voice_rows_keep_order_and_prefix_language_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = write_meta(
            tmp.path(),
            "de",
            "spk1|clips/a.wav|Guten Tag.\nspk2|clips/b.wav|Ein \"Zitat\" hier\nspk1|clips/c.wav|Noch einer\n",
        );

        let records = my_common_voice(tmp.path(), &[meta]).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            Record {
                text: "Guten Tag.".into(),
                audio_path: "de/clips/a.wav".into(),
                speaker_id: "spk1".into(),
                language: "de".into(),
            }
        );
        assert_eq!(records[1].text, "Ein \"Zitat\" hier");
        assert_eq!(records[2].audio_path, "de/clips/c.wav");
    }

    #[test]
    fn css10_uses_normalized_text_and_a_single_speaker() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = write_meta(tmp.path(), "fi", "wavs/x_0001.wav|Yksi, 2.|Yksi, kaksi.|3.21\n");

        let records = css10(tmp.path(), &[meta]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "Yksi, kaksi.");
        assert_eq!(records[0].speaker_id, "css10_fi");
        assert_eq!(records[0].audio_path, "fi/wavs/x_0001.wav");
    }

    #[test]
    fn ljspeech_builds_wav_paths_from_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = write_meta(tmp.path(), "en", "LJ001-0001|Printing, in 1st sense|Printing, in first sense\n");

        let records = ljspeech(tmp.path(), &[meta]).unwrap();
        assert_eq!(records[0].audio_path, "en/wavs/LJ001-0001.wav");
        assert_eq!(records[0].text, "Printing, in first sense");
        assert_eq!(records[0].speaker_id, "ljspeech");
        assert_eq!(records[0].language, "en");
    }

    #[test]
    fn malformed_row_names_file_and_line() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = write_meta(tmp.path(), "en", "spk|a.wav|ok\nbroken row\n");

        let err = my_common_voice(tmp.path(), &[meta]).unwrap_err();
        assert!(format!("{err:#}").contains("meta.csv:2"), "{err:#}");
    }

    #[test]
    fn pipes_in_common_voice_text_are_kept_on_any_line() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = write_meta(tmp.path(), "en", "spk|a.wav|hello|world\nspk|b.wav|plain\nspk|c.wav|a | b |\n");

        let records = my_common_voice(tmp.path(), &[meta]).unwrap();
        let texts: Vec<_> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["hello|world", "plain", "a | b |"]);
        assert_eq!(records[0].audio_path, "en/a.wav");
    }

    #[test]
    fn extra_fields_are_rejected_on_the_first_line_too() {
        let tmp = tempfile::tempdir().unwrap();
        let first = write_meta(tmp.path(), "fi", "a.wav|Yksi|Yksi|x|1.0\n");
        let err = css10(tmp.path(), &[first]).unwrap_err();
        assert!(format!("{err:#}").contains("meta.csv:1"), "{err:#}");

        let later = write_meta(tmp.path(), "sv", "a.wav|Ett|Ett|1.0\nb.wav|Två|Två|x|1.0\n");
        let err = css10(tmp.path(), &[later]).unwrap_err();
        assert!(format!("{err:#}").contains("meta.csv:2"), "{err:#}");
    }

    #[test]
    fn lookup_by_name() {
        assert!(get_loader_by_name("my_common_voice").is_ok());
        assert!(get_loader_by_name("css10").is_ok());
        let err = get_loader_by_name("vctk").unwrap_err();
        assert!(err.to_string().contains("ljspeech"), "{err}");
    }
}
