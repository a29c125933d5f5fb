use std::sync::Arc;

use pingora::services::listening::Service;
use pingora_core::{
    server::{configuration::Opt, Server},
    services::background::background_service,
};

use modgate::{
    admin::AdminHttpApp,
    config::Config,
    core::status::StateSource,
    logging::GatewayLog,
    proxy::Gateway,
    service::{
        bootstrap::GatewayBootstrap, maintenance::ClusterMaintenance, status::StatusHttpApp,
    },
};

fn main() {
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let gateway_log = if let Some(log_cfg) = &config.log {
        let gateway_log = GatewayLog::new(log_cfg.clone(), &config.cluster.node_id);
        gateway_log.init_env_logger();
        Some(gateway_log)
    } else {
        env_logger::init();
        None
    };

    let gateway = Arc::new(Gateway::new(&config));
    let source = if config.cluster.etcd.is_some() {
        StateSource::Etcd
    } else {
        StateSource::Local
    };
    log::info!(
        "Node {} starting with {} state",
        config.cluster.node_id,
        source.as_str()
    );

    let mut server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = gateway_log {
        log::info!("Adding gateway log service...");
        server.add_service(log_service);
    }

    log::info!("Adding bootstrap service...");
    server.add_service(background_service(
        "gateway bootstrap",
        GatewayBootstrap::new(
            gateway.clone(),
            config.modules.clone(),
            config.tenants.clone(),
            source,
        ),
    ));

    if let Some(reload_sync) = gateway.reload_sync() {
        log::info!("Adding reload sync service...");
        server.add_service(background_service("reload sync", reload_sync));
    }

    if let Some(membership_sync) = gateway.membership_sync() {
        log::info!("Adding cluster membership service...");
        server.add_service(background_service("cluster membership", membership_sync));
    }

    log::info!("Adding cluster maintenance service...");
    server.add_service(background_service(
        "cluster maintenance",
        ClusterMaintenance::new(gateway.clone(), config.cluster.maintenance_interval()),
    ));

    log::info!("Adding admin service...");
    server.add_service(AdminHttpApp::admin_http_service(
        &config.admin,
        gateway.clone(),
    ));

    if let Some(status_cfg) = &config.status {
        log::info!("Adding status service...");
        server.add_service(StatusHttpApp::status_http_service(status_cfg));
    }

    if let Some(prometheus_cfg) = &config.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Starting server...");
    server.run_forever();
}
