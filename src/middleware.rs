use actix_cors::Cors;

/// The HTTP surface is read-only, so any origin may query it.
pub fn cors_middleware() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allowed_methods(vec!["GET"])
        .allow_any_header()
        .max_age(3600)
}
