use utoipa::OpenApi;

use crate::server::ErrorResponse;
use crate::types::{
    GenerateReq, GenerateResp, GeneratedImage, Generation, SessionReq, User,
    UserStatus,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::generate_handler,
        crate::server::session_handler,
        crate::server::user_handler,
        crate::server::upgrade_handler,
        crate::server::images_handler,
        crate::server::generations_handler,
    ),
    components(
        schemas(
            GenerateReq,
            GenerateResp,
            SessionReq,
            User,
            UserStatus,
            GeneratedImage,
            Generation,
            ErrorResponse
        )
    ),
    tags(
        (name = "pixgate", description = "Image generation with daily quotas")
    ),
    info(
        title = "Pixgate API",
        version = "1.0",
        description = "Prompt-to-image generation behind a server-held API key, \
            with a free daily quota and a premium tier.",
        contact(
            name = "Connor Dirks & Siraaj Khandkar",
            email = "cdirks4@me.com"
        ),
        license(
            name = "BSD-3-Clause"
        )
    )
)]
pub struct ApiDoc;
