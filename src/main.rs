use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use moviolive_billing::{
    config::Config,
    db::{
        postgres_event_repository::PostgresEventRepository,
        postgres_stripe_event_log_repository::PostgresStripeEventLogRepository,
        postgres_subscription_transition_repository::PostgresSubscriptionTransitionRepository,
        postgres_user_repository::PostgresUserRepository, user_repository::UserRepository,
    },
    responses::JsonResponse,
    routes::build_router,
    services::{billing::BillingService, smtp_mailer::SmtpMailer, stripe::LiveStripeService},
    state::AppState,
    utils::jwt::JwtKeys,
    worker,
};

fn init_tracing() {
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (plain, json) = if json_logs {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(sentry_tracing::layer())
        .init();
}

async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    info!("connected to the database");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_tracing();

    let rate_limit_ms: u64 = std::env::var("RATE_LIMITER_MILLISECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(200);
    let rate_limit_burst: u32 = std::env::var("RATE_LIMITER_BURST")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(20);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(rate_limit_ms)
            .burst_size(rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .ok_or_else(|| anyhow!("invalid rate limiter configuration"))?,
    );

    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let pg_pool = establish_connection(&config.database_url).await?;
    let user_repo = Arc::new(PostgresUserRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn UserRepository>;
    let transition_repo = Arc::new(PostgresSubscriptionTransitionRepository {
        pool: pg_pool.clone(),
    });
    let event_log_repo = Arc::new(PostgresStripeEventLogRepository {
        pool: pg_pool.clone(),
    });

    let stripe = Arc::new(LiveStripeService::from_settings(&config.stripe));
    let mailer = Arc::new(SmtpMailer::from_settings(&config.smtp)?);
    let jwt_keys = Arc::new(JwtKeys::from_secret(&config.jwt_secret)?);

    let billing = Arc::new(BillingService::new(
        user_repo.clone(),
        transition_repo,
        event_log_repo,
        stripe.clone(),
        mailer,
        config.base_url.clone(),
    ));

    let state = AppState {
        db: user_repo,
        events: Arc::new(PostgresEventRepository {
            pool: pg_pool.clone(),
        }),
        billing: billing.clone(),
        stripe,
        jwt_keys,
        jwt_issuer: Arc::from(config.jwt_issuer.as_str()),
        jwt_audience: Arc::from(config.jwt_audience.as_str()),
        auth_cookie_secure: config.auth_cookie_secure,
    };

    let cors = CorsLayer::new()
        .allow_origin(config.frontend_origin.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true);

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(cors);

    worker::start_subscription_sweep(billing, config.sweep.clone());

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "moviolive billing listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
