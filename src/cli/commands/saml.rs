use clap::{Arg, ArgAction, Command};

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("idp-metadata-url")
                .long("idp-metadata-url")
                .help("IdP metadata location")
                .long_help(
                    "IdP metadata location: file:///path/to/metadata.xml or an http(s) URL, downloaded once at startup",
                )
                .env("SAMLSP_IDP_METADATA_URL")
                .required(true),
        )
        .arg(
            Arg::new("entity-id")
                .long("entity-id")
                .help("Entity ID of this service provider, as registered at the IdP")
                .env("SAMLSP_ENTITY_ID")
                .required(true),
        )
        .arg(
            Arg::new("backend-url")
                .long("backend-url")
                .help("Public base URL of this backend, example: https://backend.tld")
                .long_help(
                    "Public base URL of this backend. The ACS, SLO and metadata endpoints advertised to the IdP are derived from it",
                )
                .env("SAMLSP_BACKEND_URL")
                .required(true),
        )
        .arg(
            Arg::new("frontend-origin")
                .long("frontend-origin")
                .help("Frontend origin allowed for CORS and as redirect target (repeatable)")
                .env("SAMLSP_FRONTEND_ORIGIN")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
}
