use crate::cli::OutputFormat;
use crate::profile_yaml::ResolvedProfile;
use std::path::Path;

mod human;
mod json;

pub(crate) trait OutputFormatter: Send + Sync {
    fn print_header(&self, profile_path: &Path, profile: &ResolvedProfile);
    fn progress(&self) -> Option<cpsim_core::runner::ProgressFn>;
    fn print_summary(&self, summary: &cpsim_core::RunSummary) -> anyhow::Result<()>;
}

pub(crate) fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Box::new(human::HumanReadableOutput::new()),
        OutputFormat::Json => Box::new(json::JsonOutput),
    }
}
