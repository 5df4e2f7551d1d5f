use std::{
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// One normalized CIDR ready to be handed to a scan worker, together with
/// the number of addresses it covers (the unit of progress accounting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub cidr: String,
    pub hosts: u64,
}

/// Parse a single candidate the way `ip_network(raw, strict=False)` would:
/// host bits are allowed and masked off, bare addresses become /32 or /128.
pub fn parse_network(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let net = if raw.contains('/') {
        raw.parse::<IpNet>().ok()?
    } else {
        IpNet::from(raw.parse::<IpAddr>().ok()?)
    };
    Some(net.trunc())
}

/// Parse every candidate, collapse the valid ones into their minimal
/// covering set, and sort by (version, network address, prefix length).
/// Unparseable entries come back in the second list; they're never fatal
/// here, the caller decides what an empty result means.
pub fn parse_and_collapse(raw: &[String]) -> (Vec<IpNet>, Vec<String>) {
    let mut networks = Vec::new();
    let mut invalid = Vec::new();
    for candidate in raw {
        match parse_network(candidate) {
            Some(net) => networks.push(net),
            None => invalid.push(candidate.trim().to_string()),
        }
    }

    let mut collapsed = IpNet::aggregate(&networks);
    collapsed.sort_by_key(sort_key);
    (collapsed, invalid)
}

fn sort_key(net: &IpNet) -> (u8, u128, u8) {
    match net {
        IpNet::V4(net) => (4, u32::from(net.network()) as u128, net.prefix_len()),
        IpNet::V6(net) => (6, u128::from(net.network()), net.prefix_len()),
    }
}

/// Turn collapsed networks into the flat work list. v6 passes through
/// untouched; v4 networks shorter than `chunk_prefix_v4` are expanded into
/// their constituent subnets at that prefix. The returned host count is the
/// sum over the collapsed inputs, so chunking never changes it.
pub fn prepare(networks: &[IpNet], chunk_prefix_v4: Option<u8>) -> (Vec<WorkItem>, u64) {
    let mut items = Vec::new();
    let mut host_count: u64 = 0;
    for net in networks {
        host_count = host_count.saturating_add(num_addresses(net));

        if let (IpNet::V4(v4), Some(prefix)) = (net, chunk_prefix_v4) {
            if v4.prefix_len() < prefix {
                if let Ok(chunks) = v4.subnets(prefix) {
                    for chunk in chunks {
                        items.push(WorkItem {
                            cidr: chunk.to_string(),
                            hosts: num_addresses(&IpNet::V4(chunk)),
                        });
                    }
                    continue;
                }
            }
        }

        items.push(WorkItem {
            cidr: net.to_string(),
            hosts: num_addresses(net),
        });
    }
    (items, host_count)
}

/// Total addresses in a network, network and broadcast included. Saturates
/// for v6 prefixes shorter than /64; nobody is feeding a /0 of v6 space
/// through a subprocess scanner anyway.
pub fn num_addresses(net: &IpNet) -> u64 {
    let host_bits = (net.max_prefix_len() - net.prefix_len()) as u32;
    if host_bits >= 64 {
        u64::MAX
    } else {
        1u64 << host_bits
    }
}

/// Minimal CIDR cover of an inclusive address range. Returns None when the
/// endpoints mix versions or are reversed.
pub fn summarize_range(start: IpAddr, end: IpAddr) -> Option<Vec<IpNet>> {
    match (start, end) {
        (IpAddr::V4(start), IpAddr::V4(end)) if start <= end => {
            Some(summarize_v4(start, end).into_iter().map(IpNet::V4).collect())
        }
        (IpAddr::V6(start), IpAddr::V6(end)) if start <= end => {
            Some(summarize_v6(start, end).into_iter().map(IpNet::V6).collect())
        }
        _ => None,
    }
}

fn summarize_v4(start: Ipv4Addr, end: Ipv4Addr) -> Vec<Ipv4Net> {
    let mut nets = Vec::new();
    let mut cursor = u32::from(start) as u64;
    let end = u32::from(end) as u64;
    while cursor <= end {
        let align_bits = if cursor == 0 {
            32
        } else {
            cursor.trailing_zeros().min(32)
        };
        let span = end - cursor + 1;
        let span_bits = 63 - span.leading_zeros();
        let bits = align_bits.min(span_bits);

        nets.push(Ipv4Net::new(Ipv4Addr::from(cursor as u32), (32 - bits) as u8).unwrap());
        cursor += 1u64 << bits;
    }
    nets
}

fn summarize_v6(start: Ipv6Addr, end: Ipv6Addr) -> Vec<Ipv6Net> {
    let mut nets = Vec::new();
    let mut cursor = u128::from(start);
    let end = u128::from(end);
    loop {
        let align_bits = if cursor == 0 {
            128
        } else {
            cursor.trailing_zeros()
        };
        let remaining = end - cursor;
        let span_bits = if remaining == u128::MAX {
            128
        } else {
            127 - (remaining + 1).leading_zeros()
        };
        let bits = align_bits.min(span_bits);

        nets.push(Ipv6Net::new(Ipv6Addr::from(cursor), (128 - bits) as u8).unwrap());

        let Some(next) = cursor.checked_add(1u128.checked_shl(bits).unwrap_or(0)) else {
            break;
        };
        if bits == 128 || next > end {
            break;
        }
        cursor = next;
    }
    nets
}

/// Load subnet candidates from a CSV file. Rows are either a CIDR in the
/// first column or a `startIp,endIp` pair that gets summarized into CIDRs.
/// Header rows (`startip`/`cidr`/`subnet`) are skipped, as is anything that
/// doesn't parse.
pub fn load_subnet_list(path: &str) -> eyre::Result<Vec<String>> {
    let input = fs::read_to_string(path)?;
    let mut subnets = Vec::new();

    for line in input.lines() {
        let mut cells = line.split(',');
        let Some(first) = cells.next().map(str::trim) else {
            continue;
        };
        if first.is_empty() {
            continue;
        }
        if matches!(first.to_lowercase().as_str(), "startip" | "cidr" | "subnet") {
            continue;
        }
        if first.contains('/') {
            subnets.push(first.to_string());
            continue;
        }

        let Some(second) = cells.next().map(str::trim) else {
            continue;
        };
        if second.is_empty() || second.to_lowercase() == "endip" {
            continue;
        }
        let (Ok(start), Ok(end)) = (first.parse::<IpAddr>(), second.parse::<IpAddr>()) else {
            continue;
        };
        if let Some(nets) = summarize_range(start, end) {
            subnets.extend(nets.iter().map(ToString::to_string));
        }
    }

    Ok(subnets)
}
