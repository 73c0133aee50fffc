use super::handlers::{auth_groups, auths, health, login, oauth, user_admin, users};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
pub(crate) fn api_router() -> OpenApiRouter {
    // Handlers sharing a path must be registered in one `routes!` call.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(login::login))
        .routes(routes!(login::logout))
        .routes(routes!(users::current_user))
        .routes(routes!(users::list_users))
        .routes(routes!(user_admin::create_user))
        .routes(routes!(user_admin::list_guests))
        .routes(routes!(user_admin::create_guest))
        .routes(routes!(user_admin::update_guest, user_admin::delete_guest))
        .routes(routes!(user_admin::reset_password))
        .routes(routes!(user_admin::delete_user))
        .routes(routes!(auth_groups::list_auth_groups))
        .routes(routes!(auth_groups::list_auth_groups_pro))
        .routes(routes!(auth_groups::create_auth_group))
        .routes(routes!(
            auth_groups::get_auth_group,
            auth_groups::update_auth_group,
            auth_groups::delete_auth_group
        ))
        .routes(routes!(
            auth_groups::get_user_groups,
            auth_groups::update_user_groups
        ))
        .routes(routes!(auths::list_auths))
        .routes(routes!(auths::get_auth_config))
        .routes(routes!(auths::set_auth_config))
        .routes(routes!(auths::delete_auth))
        .routes(routes!(oauth::authorize))
        .routes(routes!(oauth::callback));

    let mut user_tag = Tag::new("user");
    user_tag.description = Some("Console login and accounts".to_string());

    let mut group_tag = Tag::new("auth_group");
    group_tag.description = Some("Hierarchical permission groups".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Reader identities and OAuth login".to_string());

    router.get_openapi_mut().tags = Some(vec![user_tag, group_tag, auth_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (non_empty(name), non_empty(email.trim_end_matches('>'))),
        None => (non_empty(author), None),
    }
}
