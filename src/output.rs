use std::fs;
use std::io::{self, Write};

use camino::Utf8Path;
use serde::Serialize;

use crate::app::{
    LookupResult, PopulateResult, PreferredResult, ProgressEvent, ProgressSink, ReviewEntry,
    StatsResult,
};
use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_populate(result: &PopulateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_lookup(result: &LookupResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_stats(result: &StatsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_preferred(result: &PreferredResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Colored summaries on stdout, progress on stderr.
pub struct HumanOutput;

impl HumanOutput {
    pub fn print_populate(result: &PopulateResult, review_path: Option<&Utf8Path>) {
        let summary = &result.summary;
        let title = if result.dry_run {
            "textref populate (dry run)"
        } else {
            "textref populate"
        };
        println!("{CYAN}{title}{RESET}");
        println!("  rows read:          {}", summary.rows);
        println!("  skipped:            {}", summary.skipped);
        println!("{GREEN}  inserted:           {}{RESET}", summary.inserted);
        println!("{GREEN}  updated:            {}{RESET}", summary.updated);
        println!("  unchanged:          {}", summary.unchanged);
        let flawed_color = if summary.flawed > 0 { YELLOW } else { RESET };
        println!("{flawed_color}  flawed:             {}{RESET}", summary.flawed);
        let rejected_color = if summary.rejected > 0 { RED } else { RESET };
        println!("{rejected_color}  rejected:           {}{RESET}", summary.rejected);
        println!("  field conflicts:    {}", summary.conflicts);
        println!("  input conflicts:    {}", summary.input_conflicts);
        println!("{GREEN}  content inserted:   {}{RESET}", summary.content_inserted);
        println!("  content duplicates: {}", summary.content_duplicates);
        println!("  content flawed:     {}", summary.content_flawed);
        if let Some(path) = review_path {
            println!("{YELLOW}  review file: {path}{RESET}");
        }
    }

    pub fn print_lookup(result: &LookupResult) {
        println!("{CYAN}{}{RESET}", result.specifier);
        for entry in &result.records {
            let record = &entry.record;
            println!(
                "{GREEN}text ref {}{RESET}  pmid={} pmcid={} doi={}",
                record.id,
                record.pmid.as_deref().unwrap_or("-"),
                record.pmcid.as_deref().unwrap_or("-"),
                record.doi.as_deref().unwrap_or("-"),
            );
            if let Some(uid) = &record.secondary.cord_uid {
                println!("  cord_uid={uid}");
            }
            for key in &entry.content {
                println!("  content {} {} {}", key.source, key.format, key.text_type);
            }
        }
    }

    pub fn print_stats(result: &StatsResult) {
        println!("{CYAN}text refs: {}{RESET}", result.text_refs);
        println!("  with pmid:  {}", result.with_pmid);
        println!("  with pmcid: {}", result.with_pmcid);
        println!("  with doi:   {}", result.with_doi);
        println!("{CYAN}content rows: {}{RESET}", result.content_total);
        for (source, count) in &result.content_by_source {
            println!("  {source}: {count}");
        }
    }

    pub fn print_preferred(result: &PreferredResult) {
        for entry in &result.entries {
            println!(
                "{GREEN}{}{RESET} {} {} {} ({} chars)",
                entry.record_id, entry.source, entry.format, entry.text_type, entry.length
            );
        }
    }
}

impl ProgressSink for HumanOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{}", event.message),
        }
    }
}

/// Writes review entries as CSV with a header row.
pub struct ReviewWriter;

impl ReviewWriter {
    pub fn write(path: &Utf8Path, entries: &[ReviewEntry]) -> Result<(), ReconcileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_path(path.as_std_path())
            .map_err(|err| ReconcileError::Filesystem(format!("{path}: {err}")))?;
        for entry in entries {
            writer
                .serialize(entry)
                .map_err(|err| ReconcileError::Filesystem(format!("{path}: {err}")))?;
        }
        writer
            .flush()
            .map_err(|err| ReconcileError::Filesystem(format!("{path}: {err}")))?;
        Ok(())
    }
}
