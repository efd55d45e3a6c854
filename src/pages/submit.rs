use chrono::Utc;
use log::{log, Level};

use crate::{
    app::CampusContext,
    error::{CampusError, CampusResult},
    schema::{
        api::{ImageUpload, NewComplaint, DEFAULT_CATEGORY},
        db::{Complaint, Status},
        query::CollectionPath,
    },
    store::encode,
    utils::{image_object_name, non_blank},
};

/// Creates a complaint from the submission form and returns its id.
///
/// The image, if any, is uploaded first; a failed upload leaves nothing
/// behind in the document store.
pub async fn submit_complaint(
    ctx: &CampusContext,
    form: NewComplaint,
    image: Option<ImageUpload>,
) -> CampusResult<String> {
    let user = ctx.session.require_user()?;
    let title = non_blank(&form.title)
        .ok_or_else(|| CampusError::ValidationFailed("Title is required".into()))?;
    let description = non_blank(&form.description)
        .ok_or_else(|| CampusError::ValidationFailed("Description is required".into()))?;
    let category = non_blank(&form.category).unwrap_or(DEFAULT_CATEGORY);

    let image = match image {
        Some(upload) => {
            let name = image_object_name(&upload.file_name, Utc::now());
            ctx.blobs
                .upload(&name, &upload.content_type, upload.bytes)
                .await
                .map_err(|e| {
                    log!(Level::Warn, "Image upload failed: {e}");
                    CampusError::WriteFailed(e.to_string())
                })?
        }
        None => String::new(),
    };

    let complaint = Complaint {
        title: title.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        status: Status::Open,
        image,
        created_by: user.id,
        ..Default::default()
    };
    let data = encode(&complaint).map_err(CampusError::from_write)?;
    let id = ctx
        .store
        .create(&CollectionPath::complaints(), data)
        .await
        .map_err(CampusError::from_write)?;
    log!(Level::Info, "Complaint {id} submitted in {category}");
    Ok(id)
}
