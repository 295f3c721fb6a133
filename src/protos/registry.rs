//! Plugin registry and lifecycle
//!
//! Builds the read-only port table once at startup and a fresh plugin set
//! per worker. Plugin instances are not shared: each worker owns its own
//! set and flows are partitioned by hash, so plugins never need locks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::counters::Counters;
use crate::flow::PortTable;
use crate::publish::Publisher;
use super::{ProtocolId, TcpProtocol, TxEmitter, UdpProtocol};
use super::{dns, http, memcache, mongodb, mysql, pgsql, redis, thrift};

/// The plugins owned by one worker
pub struct ProtoSet {
    tcp: HashMap<ProtocolId, Box<dyn TcpProtocol>>,
    udp: HashMap<ProtocolId, Box<dyn UdpProtocol>>,
}

impl ProtoSet {
    pub fn empty() -> Self {
        Self {
            tcp: HashMap::new(),
            udp: HashMap::new(),
        }
    }

    pub fn add_tcp(&mut self, plugin: Box<dyn TcpProtocol>) {
        self.tcp.insert(plugin.id(), plugin);
    }

    pub fn add_udp(&mut self, plugin: Box<dyn UdpProtocol>) {
        self.udp.insert(plugin.id(), plugin);
    }

    pub fn tcp_mut(&mut self, id: ProtocolId) -> Option<&mut Box<dyn TcpProtocol>> {
        self.tcp.get_mut(&id)
    }

    pub fn udp_mut(&mut self, id: ProtocolId) -> Option<&mut Box<dyn UdpProtocol>> {
        self.udp.get_mut(&id)
    }

    pub fn connection_timeout(&self, id: ProtocolId) -> Duration {
        self.tcp
            .get(&id)
            .map(|p| p.connection_timeout())
            .unwrap_or(super::DEFAULT_CONNECTION_TIMEOUT)
    }

    /// Advance every plugin's transaction clock
    pub fn tick_all(&mut self, now: DateTime<Utc>) {
        for plugin in self.tcp.values_mut() {
            plugin.tick(now);
        }
        for plugin in self.udp.values_mut() {
            plugin.tick(now);
        }
    }
}

/// Build the port-to-plugin table from enabled protocol sections
pub fn build_port_table(config: &Config) -> PortTable {
    let protos = &config.protocols;
    let mut table = PortTable::new();

    if protos.http.enabled {
        table.register_tcp(ProtocolId::Http, &protos.http.ports);
    }
    if protos.mysql.enabled {
        table.register_tcp(ProtocolId::Mysql, &protos.mysql.ports);
    }
    if protos.pgsql.enabled {
        table.register_tcp(ProtocolId::Pgsql, &protos.pgsql.ports);
    }
    if protos.redis.enabled {
        table.register_tcp(ProtocolId::Redis, &protos.redis.ports);
    }
    if protos.thrift.enabled {
        table.register_tcp(ProtocolId::Thrift, &protos.thrift.ports);
    }
    if protos.mongodb.enabled {
        table.register_tcp(ProtocolId::Mongodb, &protos.mongodb.ports);
    }
    if protos.dns.enabled {
        table.register_udp(ProtocolId::Dns, &protos.dns.ports);
        table.register_tcp(ProtocolId::Dns, &protos.dns.tcp_ports);
    }
    if protos.memcache.enabled {
        table.register_tcp(ProtocolId::Memcache, &protos.memcache.ports);
        table.register_udp(ProtocolId::Memcache, &protos.memcache.ports);
    }

    table
}

/// Build one worker's plugin set
pub fn build_proto_set(
    config: &Config,
    publisher: Publisher,
    counters: Arc<Counters>,
) -> ProtoSet {
    let protos = &config.protocols;
    let local_ips: Arc<Vec<IpAddr>> = Arc::new(config.capture.local_ips.clone());
    let sample_every = config.output.sample_every;
    let emitter = |id: ProtocolId, send_req: bool, send_resp: bool| {
        TxEmitter::new(
            id,
            publisher.clone(),
            counters.clone(),
            local_ips.clone(),
            send_req,
            send_resp,
        )
        .with_sampling(sample_every)
    };

    let mut set = ProtoSet::empty();

    if protos.http.enabled {
        let e = emitter(
            ProtocolId::Http,
            protos.http.send_request,
            protos.http.send_response,
        );
        set.add_tcp(Box::new(http::HttpPlugin::new(protos.http.clone(), e)));
    }
    if protos.mysql.enabled {
        let e = emitter(
            ProtocolId::Mysql,
            protos.mysql.send_request,
            protos.mysql.send_response,
        );
        set.add_tcp(Box::new(mysql::MysqlPlugin::new(protos.mysql.clone(), e)));
    }
    if protos.pgsql.enabled {
        let e = emitter(
            ProtocolId::Pgsql,
            protos.pgsql.send_request,
            protos.pgsql.send_response,
        );
        set.add_tcp(Box::new(pgsql::PgsqlPlugin::new(protos.pgsql.clone(), e)));
    }
    if protos.redis.enabled {
        let e = emitter(
            ProtocolId::Redis,
            protos.redis.send_request,
            protos.redis.send_response,
        );
        set.add_tcp(Box::new(redis::RedisPlugin::new(protos.redis.clone(), e)));
    }
    if protos.thrift.enabled {
        let e = emitter(
            ProtocolId::Thrift,
            protos.thrift.send_request,
            protos.thrift.send_response,
        );
        set.add_tcp(Box::new(thrift::ThriftPlugin::new(protos.thrift.clone(), e)));
    }
    if protos.mongodb.enabled {
        let e = emitter(
            ProtocolId::Mongodb,
            protos.mongodb.send_request,
            protos.mongodb.send_response,
        );
        set.add_tcp(Box::new(mongodb::MongodbPlugin::new(
            protos.mongodb.clone(),
            e,
        )));
    }
    if protos.dns.enabled {
        let e = emitter(
            ProtocolId::Dns,
            protos.dns.send_request,
            protos.dns.send_response,
        );
        set.add_udp(Box::new(dns::DnsUdpPlugin::new(protos.dns.clone(), e.clone())));
        set.add_tcp(Box::new(dns::DnsTcpPlugin::new(protos.dns.clone(), e)));
    }
    if protos.memcache.enabled {
        let e = emitter(
            ProtocolId::Memcache,
            protos.memcache.send_request,
            protos.memcache.send_response,
        );
        set.add_tcp(Box::new(memcache::MemcachePlugin::new(
            protos.memcache.clone(),
            e.clone(),
        )));
        set.add_udp(Box::new(memcache::MemcacheUdpPlugin::new(
            protos.memcache.clone(),
            e,
        )));
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputSettings;
    use crate::publish::{CollectorSink, PublisherThread};

    #[test]
    fn test_port_table_covers_enabled_protocols() {
        let config = Config::default();
        let table = build_port_table(&config);
        assert!(!table.is_empty());

        let tcp_protos: Vec<ProtocolId> = table.tcp_ports().map(|(_, &p)| p).collect();
        assert!(tcp_protos.contains(&ProtocolId::Http));
        assert!(tcp_protos.contains(&ProtocolId::Mysql));
        assert!(tcp_protos.contains(&ProtocolId::Dns));
    }

    #[test]
    fn test_disabled_protocol_unregistered() {
        let mut config = Config::default();
        config.protocols.redis.enabled = false;
        let table = build_port_table(&config);
        let tcp_protos: Vec<ProtocolId> = table.tcp_ports().map(|(_, &p)| p).collect();
        assert!(!tcp_protos.contains(&ProtocolId::Redis));
    }

    #[test]
    fn test_proto_set_has_all_default_plugins() {
        let config = Config::default();
        let counters = Arc::new(Counters::default());
        let publisher = PublisherThread::spawn(
            Box::new(CollectorSink::new()),
            &OutputSettings::default(),
            counters.clone(),
        );
        let mut set = build_proto_set(&config, publisher.handle(), counters);

        for id in [
            ProtocolId::Http,
            ProtocolId::Mysql,
            ProtocolId::Pgsql,
            ProtocolId::Redis,
            ProtocolId::Thrift,
            ProtocolId::Mongodb,
            ProtocolId::Memcache,
        ] {
            assert!(set.tcp_mut(id).is_some(), "missing tcp plugin {}", id);
        }
        assert!(set.udp_mut(ProtocolId::Dns).is_some());
        assert!(set.tcp_mut(ProtocolId::Dns).is_some());
        publisher.shutdown();
    }
}
