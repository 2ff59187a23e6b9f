use std::io::{self, Write};

use clap::ValueEnum;
use serde::Serialize;

use crate::accountability::AccountabilityReport;
use crate::composite::CompositeReport;
use crate::duplicates::DuplicateReport;
use crate::finding::{Finding, FindingSet, FindingSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Report, findings and summary as one JSON document.
    #[default]
    Json,
    /// One tab-separated line per finding.
    List,
    /// Counts for a human reader.
    Summary,
}

/// A finished analysis, ready to be written once processing completes.
pub enum AuditOutput {
    Duplicates(DuplicateReport),
    Accountability(AccountabilityReport),
    Composite(CompositeReport),
}

impl AuditOutput {
    pub fn analysis(&self) -> &'static str {
        match self {
            AuditOutput::Duplicates(_) => "duplicates",
            AuditOutput::Accountability(_) => "accountability",
            AuditOutput::Composite(_) => "composite",
        }
    }

    pub fn findings(&self) -> FindingSet {
        match self {
            AuditOutput::Duplicates(report) => report.findings(),
            AuditOutput::Accountability(report) => report.findings(),
            AuditOutput::Composite(report) => report.findings().clone(),
        }
    }
}

#[derive(Serialize)]
struct JsonDocument<'a, T: Serialize> {
    analysis: &'static str,
    report: &'a T,
    findings: &'a [Finding],
    summary: &'a FindingSummary,
}

pub struct ReportWriter;

impl ReportWriter {
    pub fn print(output: &AuditOutput, format: OutputFormat) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        Self::write(&mut stdout, output, format)?;
        stdout.flush()
    }

    pub fn write<W: Write>(
        writer: &mut W,
        output: &AuditOutput,
        format: OutputFormat,
    ) -> io::Result<()> {
        let findings = output.findings();
        match format {
            OutputFormat::Json => match output {
                AuditOutput::Duplicates(report) => {
                    write_json(writer, output.analysis(), report, &findings)
                }
                AuditOutput::Accountability(report) => {
                    write_json(writer, output.analysis(), report, &findings)
                }
                AuditOutput::Composite(report) => {
                    write_json(writer, output.analysis(), report, &findings)
                }
            },
            OutputFormat::List => {
                for finding in findings.iter() {
                    let rules = finding
                        .rules
                        .iter()
                        .map(|rule| rule.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    writeln!(writer, "{}\t{}\t{}", finding.subject, rules, finding.reason)?;
                }
                Ok(())
            }
            OutputFormat::Summary => {
                write_summary(writer, output)?;
                write_counts(writer, findings.summary())
            }
        }
    }
}

fn write_json<W: Write, T: Serialize>(
    writer: &mut W,
    analysis: &'static str,
    report: &T,
    findings: &FindingSet,
) -> io::Result<()> {
    let document = JsonDocument {
        analysis,
        report,
        findings: findings.as_slice(),
        summary: findings.summary(),
    };
    serde_json::to_writer_pretty(&mut *writer, &document).map_err(io::Error::other)?;
    writer.write_all(b"\n")
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn write_summary<W: Write>(writer: &mut W, output: &AuditOutput) -> io::Result<()> {
    match output {
        AuditOutput::Duplicates(report) => {
            writeln!(
                writer,
                "{}: {} granules, {} unique, {} duplicates ({:.2}%), {} unparsed",
                report.product,
                report.total,
                report.unique,
                report.duplicate_count,
                percent(report.duplicate_count, report.total),
                report.unparsed
            )?;
            for (period, counts) in &report.by_period {
                writeln!(
                    writer,
                    "  {period}: {} total, {} unique, {} duplicates",
                    counts.total, counts.unique, counts.duplicate_count
                )?;
            }
        }
        AuditOutput::Accountability(report) => {
            writeln!(
                writer,
                "{}: {} expected, {} matched, {} missing ({:.2}%), {} unparsed inputs, {} filtered out, {} unlinked outputs",
                report.input_product,
                report.expected_count,
                report.matched_count,
                report.missing_count(),
                percent(report.missing_count(), report.expected_count),
                report.unparsed_inputs,
                report.filtered_out,
                report.unlinked_outputs
            )?;
            for (period, counts) in &report.by_period {
                writeln!(
                    writer,
                    "  {period}: {} expected, {} matched, {} missing",
                    counts.expected, counts.matched, counts.missing
                )?;
            }
        }
        AuditOutput::Composite(report) => {
            writeln!(
                writer,
                "{} scanned, {} passed, {} failed, {} missing manifests, {} manifest warnings",
                report.scanned,
                report.passed,
                report.failed,
                report.missing_manifests,
                report.warnings.len()
            )?;
            if let Some(span) = &report.span {
                writeln!(
                    writer,
                    "  time span over {} granules: min {:.2}, mean {:.2}, max {:.2} minutes",
                    span.granules, span.min_minutes, span.mean_minutes, span.max_minutes
                )?;
            }
        }
    }
    Ok(())
}

fn write_counts<W: Write>(writer: &mut W, summary: &FindingSummary) -> io::Result<()> {
    if summary.is_clean() {
        return writeln!(writer, "no findings");
    }
    writeln!(writer, "{} findings", summary.total)?;
    for (rule, count) in &summary.by_rule {
        writeln!(writer, "  {rule}: {count}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountability::{self, MultiplicityPolicy, OutputLinkage};
    use crate::domain::{GranuleRecord, ProductType};
    use crate::duplicates;

    fn duplicate_output() -> AuditOutput {
        let granules = [
            "HLS.S30.T11SNT.2022335T182731.v2.0",
            "HLS.S30.T11SNT.2022335T182731.v2.0",
        ]
        .map(GranuleRecord::named);
        AuditOutput::Duplicates(duplicates::detect(&granules, ProductType::Hls))
    }

    #[test]
    fn list_prints_one_line_per_finding() {
        let mut buffer = Vec::new();
        ReportWriter::write(&mut buffer, &duplicate_output(), OutputFormat::List).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(
            text,
            "HLS.S30.T11SNT.2022335T182731\tduplicate identity\t2 granules share canonical identity\n"
        );
    }

    #[test]
    fn json_carries_summary() {
        let mut buffer = Vec::new();
        ReportWriter::write(&mut buffer, &duplicate_output(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(value["analysis"], "duplicates");
        assert_eq!(value["report"]["unique"], 1);
        assert_eq!(value["summary"]["total"], 1);
        assert_eq!(value["summary"]["by_rule"]["duplicate_identity"], 1);
    }

    #[test]
    fn summary_reports_rate() {
        let mut buffer = Vec::new();
        ReportWriter::write(&mut buffer, &duplicate_output(), OutputFormat::Summary).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("HLS: 2 granules, 1 unique, 1 duplicates (50.00%), 0 unparsed"));
        assert!(text.contains("1 findings"));
    }

    #[test]
    fn accountability_summary_separates_unparsed_inputs() {
        let inputs = ["HLS.S30.T11SNT.2025100T180000.v2.0", "not-an-hls-name"].map(GranuleRecord::named);
        let outputs: [GranuleRecord; 0] = [];
        let policy = MultiplicityPolicy::new(ProductType::Hls, OutputLinkage::SharedIdentity);
        let report = accountability::map_accountability(&inputs, &outputs, &policy);
        let mut buffer = Vec::new();
        ReportWriter::write(
            &mut buffer,
            &AuditOutput::Accountability(report),
            OutputFormat::Summary,
        )
        .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("2 missing (100.00%), 1 unparsed inputs"), "{text}");
    }
}
