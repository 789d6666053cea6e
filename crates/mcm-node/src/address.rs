//! 本机可路由地址发现。
//!
//! 常态路径：解析引导服务的 DNS 名（`tasks.<service>`），枚举本机
//! 非回环网卡的 IPv4 地址，取两个集合的交集。容器编排的 DNS 在启动
//! 初期可能尚未收敛，因此以 1 秒间隔重试最多 5 分钟；仍失败则致命。
//! 显式指定网卡名时直接取该网卡的第一个 IPv4 地址。

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mcm_core::{FailureClass, McmError, McmResult, codes};
use tracing::{debug, info};

/// 发现预算：300 次 × 1 秒。
const DISCOVERY_ATTEMPTS: u32 = 300;
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// 发现本机地址；耗尽预算即致命。
pub async fn discover_address(
    service: &str,
    interface_override: Option<&str>,
) -> McmResult<Ipv4Addr> {
    for attempt in 1..=DISCOVERY_ATTEMPTS {
        if let Some(address) = try_discover(service, interface_override).await {
            info!(%address, "discovered local routable address");
            return Ok(address);
        }
        debug!(attempt, service, "address discovery not conclusive yet");
        tokio::time::sleep(DISCOVERY_INTERVAL).await;
    }
    Err(McmError::new(
        codes::NODE_ADDRESS_DISCOVERY,
        FailureClass::Fatal,
        format!("unable to discover the local address for service `{service}`"),
    ))
}

async fn try_discover(service: &str, interface_override: Option<&str>) -> Option<Ipv4Addr> {
    if let Some(interface) = interface_override {
        return first_ipv4_of_interface(interface);
    }

    let host = format!("tasks.{service}");
    let service_addrs: HashSet<Ipv4Addr> = tokio::net::lookup_host((host.as_str(), 0))
        .await
        .ok()?
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    if service_addrs.is_empty() {
        return None;
    }

    for ifaddr in nix::ifaddrs::getifaddrs().ok()? {
        if ifaddr.interface_name == "lo" {
            continue;
        }
        let Some(ip) = ipv4_of(&ifaddr) else { continue };
        if service_addrs.contains(&ip) {
            debug!(interface = %ifaddr.interface_name, %ip, "local address matches service dns");
            return Some(ip);
        }
    }
    None
}

/// 指定网卡的第一个 IPv4 地址。
fn first_ipv4_of_interface(name: &str) -> Option<Ipv4Addr> {
    nix::ifaddrs::getifaddrs()
        .ok()?
        .filter(|ifaddr| ifaddr.interface_name == name)
        .find_map(|ifaddr| ipv4_of(&ifaddr))
}

fn ipv4_of(ifaddr: &nix::ifaddrs::InterfaceAddress) -> Option<Ipv4Addr> {
    ifaddr
        .address
        .as_ref()
        .and_then(|addr| addr.as_sockaddr_in())
        .map(|sin| sin.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_interface_yields_its_address() {
        // 回环网卡在任何 Linux 环境都存在，作为网卡枚举路径的冒烟。
        let ip = first_ipv4_of_interface("lo").expect("lo 应有 IPv4 地址");
        assert!(ip.is_loopback());
    }

    #[test]
    fn unknown_interface_yields_nothing() {
        assert!(first_ipv4_of_interface("no-such-interface-0").is_none());
    }
}
