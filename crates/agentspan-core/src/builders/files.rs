//! `file_processing` spans for events that carry attached files

use tracing::debug;

use super::BuildScope;
use crate::classifier::CorrelationId;
use crate::error::Result;
use crate::models::{AttrKey, Attributes, FileField, FilesEvent, OperationKind, SpanKind, Status, TraceEvent};
use crate::timing::TimedOperation;
use crate::tracer::SpanHandle;

/// Emit one `file_processing` span describing every attached file
pub fn emit_files(
    scope: &mut BuildScope<'_>,
    event: &TraceEvent,
    correlation: &CorrelationId,
    parent: SpanHandle,
    files: &FilesEvent,
) -> Result<()> {
    let timing = scope
        .timing
        .resolve(TimedOperation::FileOperations, event, correlation);
    let types: Vec<&str> = files
        .files
        .iter()
        .map(|f| f.kind.as_deref().unwrap_or("unknown"))
        .collect();

    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::FileOperation)
        .with(AttrKey::FileCount, files.files.len())
        .with(AttrKey::FileTypes, serde_json::to_string(&types)?);
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    for (index, file) in files.files.iter().enumerate() {
        let key = |field| AttrKey::File { index, field };
        attributes.insert(key(FileField::Name), file.name.as_deref().unwrap_or_default());
        attributes.insert(key(FileField::Type), file.kind.as_deref().unwrap_or_default());
        attributes.insert(key(FileField::Size), file.size.unwrap_or_default());
        if let Some(metadata) = &file.metadata {
            attributes.insert(key(FileField::Metadata), serde_json::to_string(metadata)?);
        }
        if let Some(content) = &file.content {
            attributes.insert(
                key(FileField::ContentType),
                content.content_type.as_deref().unwrap_or_default(),
            );
            if let Some(size) = content.size {
                attributes.insert(key(FileField::ContentSize), size);
            }
        }
    }

    let span = scope.registry.start_span(
        "file_processing",
        Some(parent),
        SpanKind::Internal,
        attributes,
        Some(timing.start),
    );
    scope.registry.end_span(span, Status::ok());
    debug!(correlation_id = %correlation, files = files.files.len(), "File operations recorded");
    Ok(())
}
