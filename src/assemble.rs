//! Pointwise conversion of inference results into output records.

use crate::engine::Inference;
use crate::error::{PipelineError, Result};
use crate::record::{OutputRecord, PagePart};

/// Builds the output record for one inference result.
///
/// Body text requires a line number; titles and descriptions never carry one.
pub fn assemble_record(inference: Inference, part: PagePart) -> Result<OutputRecord> {
    let Inference { entities, meta } = inference;
    let line_number = if part.has_line_numbers() {
        match meta.line_number {
            Some(line_number) => Some(line_number),
            None => {
                return Err(PipelineError::malformed(
                    meta.page_id,
                    "text unit reached assembly without a line number",
                ))
            }
        }
    } else {
        None
    };
    Ok(OutputRecord {
        page_id: meta.page_id,
        entities,
        line_number,
    })
}

/// Lazily assembles a stream of inference results.
pub fn assemble<I>(inferences: I, part: PagePart) -> impl Iterator<Item = Result<OutputRecord>>
where
    I: Iterator<Item = Result<Inference>>,
{
    inferences.map(move |inference| inference.and_then(|i| assemble_record(i, part)))
}
