use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("SAMLSP_DSN")
                .required(true),
        )
        .arg(
            Arg::new("db-max-connections")
                .long("db-max-connections")
                .help("Maximum number of pooled database connections")
                .default_value("5")
                .env("SAMLSP_DB_MAX_CONNECTIONS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("db-min-connections")
                .long("db-min-connections")
                .help("Connections kept open when idle")
                .default_value("1")
                .env("SAMLSP_DB_MIN_CONNECTIONS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("db-max-lifetime")
                .long("db-max-lifetime")
                .help("Seconds before a pooled connection is recycled")
                .default_value("120")
                .env("SAMLSP_DB_MAX_LIFETIME")
                .value_parser(clap::value_parser!(u64)),
        )
}
