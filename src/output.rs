//! Output formatting for search results and repository listings

use crate::index::types::{FileMatch, LineMatch, RepoList, Stats};
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Display flags shared by the printers
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintOptions {
    pub color: bool,
    /// Print the file name once above its lines instead of on every line
    pub heading: bool,
    /// Append the score (and debug breakdown when present) to file headers
    pub scores: bool,
}

fn stdout(color: bool) -> StandardStream {
    StandardStream::stdout(if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    })
}

/// `repo/path` as shown to the user
fn display_path(file: &FileMatch) -> String {
    if file.repository.is_empty() {
        file.file_name.clone()
    } else {
        format!("{}/{}", file.repository, file.file_name)
    }
}

/// Print file matches in ripgrep-style format
pub fn print_file_matches(files: &[FileMatch], opts: PrintOptions) -> io::Result<()> {
    let mut out = stdout(opts.color);
    write_file_matches(&mut out, files, opts)
}

pub fn write_file_matches<W: WriteColor>(
    out: &mut W,
    files: &[FileMatch],
    opts: PrintOptions,
) -> io::Result<()> {
    for (i, file) in files.iter().enumerate() {
        let path = display_path(file);

        if opts.heading {
            if i > 0 {
                writeln!(out)?;
            }
            out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
            write!(out, "{}", path)?;
            out.reset()?;
            if opts.scores {
                write_score(out, file)?;
            }
            writeln!(out)?;
        }

        for line in file.line_matches.iter().filter(|l| !l.file_name) {
            write_line(out, &path, line, opts.heading)?;
        }
    }
    Ok(())
}

fn write_score<W: WriteColor>(out: &mut W, file: &FileMatch) -> io::Result<()> {
    out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
    write!(out, " [{:.2}]", file.score)?;
    if let Some(debug) = &file.debug {
        write!(out, " {}", debug)?;
    }
    out.reset()
}

/// Print a matching line with every fragment highlighted
fn write_line<W: WriteColor>(
    out: &mut W,
    path: &str,
    line: &LineMatch,
    heading: bool,
) -> io::Result<()> {
    if !heading {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
        write!(out, "{}", path)?;
        out.reset()?;
        write!(out, ":")?;
    }

    out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
    write!(out, "{}", line.line_number)?;
    out.reset()?;
    write!(out, ":")?;

    let text = line.line.trim_end_matches(['\n', '\r']);
    let mut pos = 0;
    for frag in &line.fragments {
        let start = frag.line_offset.max(pos).min(text.len());
        let end = (frag.line_offset + frag.match_length).min(text.len());
        // Offsets that split a UTF-8 sequence are left unhighlighted
        let (Some(before), Some(matched)) = (text.get(pos..start), text.get(start..end)) else {
            continue;
        };
        write!(out, "{}", before)?;
        if !matched.is_empty() {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
            write!(out, "{}", matched)?;
            out.reset()?;
        }
        pos = end;
    }
    if let Some(rest) = text.get(pos..) {
        write!(out, "{}", rest)?;
    }

    writeln!(out)
}

/// Print only file names (for -l flag)
pub fn print_files_only(files: &[FileMatch], color: bool) -> io::Result<()> {
    let mut out = stdout(color);
    for file in files {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
        writeln!(out, "{}", display_path(file))?;
        out.reset()?;
    }
    Ok(())
}

/// Print match count per file (for -c flag)
pub fn print_match_counts(files: &[FileMatch], color: bool) -> io::Result<()> {
    let mut out = stdout(color);
    for file in files {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
        write!(out, "{}", display_path(file))?;
        out.reset()?;
        write!(out, ":")?;
        out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
        writeln!(out, "{}", file.match_count())?;
        out.reset()?;
    }
    Ok(())
}

/// Print a one-line summary of search stats to stderr
pub fn print_stats_summary(stats: &Stats, shown: usize) -> io::Result<()> {
    let mut err = io::stderr().lock();
    write!(
        err,
        "{} files shown, {} matched, {} shards searched in {:.1?}",
        shown, stats.file_count, stats.shards_scanned, stats.duration
    )?;
    if stats.crashes > 0 {
        write!(err, " ({} shards crashed)", stats.crashes)?;
    }
    writeln!(err)
}

pub fn print_repo_list(list: &RepoList, color: bool) -> io::Result<()> {
    let mut out = stdout(color);
    write_repo_list(&mut out, list)
}

pub fn write_repo_list<W: WriteColor>(out: &mut W, list: &RepoList) -> io::Result<()> {
    let mut entries: Vec<_> = list.repos.iter().collect();
    entries.sort_by(|a, b| a.repository.name.cmp(&b.repository.name));

    for entry in entries {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
        write!(out, "{}", entry.repository.name)?;
        out.reset()?;

        let branches: Vec<&str> = entry
            .repository
            .branches
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        if !branches.is_empty() {
            write!(out, " [{}]", branches.join(", "))?;
        }
        writeln!(
            out,
            " {} documents, {} shards",
            entry.stats.documents, entry.stats.shards
        )?;
    }

    let mut ids: Vec<_> = list.repos_map.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        writeln!(out, "#{}", id)?;
    }

    if list.crashes > 0 {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
        writeln!(out, "{} shards crashed", list.crashes)?;
        out.reset()?;
    }
    Ok(())
}
