use sonic_bridge_api::router::ApiDoc;
use utoipa::OpenApi;

/// Writes the OpenAPI document to `path`, or prints it when no path is given.
fn generate_spec(
    api_doc: utoipa::openapi::OpenApi,
    path: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec_json = api_doc.to_pretty_json()?;
    match path {
        Some(path) => std::fs::write(path, spec_json)?,
        None => println!("{spec_json}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1);
    generate_spec(ApiDoc::openapi(), path.as_deref())?;
    Ok(())
}
