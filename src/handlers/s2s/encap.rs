//! ENCAP: encapsulated commands that always propagate everywhere, with
//! local interpretation of the subcommands we know (KLINE, UNKLINE,
//! GCAP).

use petrel_proto::Message;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::{HandlerError, HandlerResult};
use crate::event::ConnId;
use crate::state::ident::parse_capabs;
use crate::state::kline::KLine;
use crate::state::uid::{Sid, Uid};

pub fn encap(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <destination mask> <subcommand> [args...]; the destination is
    // taken to cover us.
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "ENCAP");
        return Ok(());
    }

    let subcommand = msg.params[1].to_ascii_uppercase();
    let subparams: Vec<String> = msg.params.iter().skip(2).cloned().collect();
    let prefix = msg.prefix.as_deref().unwrap_or("").to_string();

    match subcommand.as_str() {
        "KLINE" => kline(d, conn, &prefix, &subparams)?,
        "UNKLINE" => unkline(d, conn, &prefix, &subparams)?,
        "GCAP" => gcap(d, &prefix, &subparams)?,
        _ => {}
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// The name of whoever is acting, user or server, by prefix.
fn source_name(d: &Dispatcher, prefix: &str) -> Option<String> {
    d.world
        .users
        .get(&Uid::new(prefix))
        .map(|u| u.nick.clone())
        .or_else(|| {
            d.world
                .servers
                .get(&Sid::new(prefix))
                .map(|s| s.name.clone())
        })
}

/// KLINE travels only inside ENCAP.
/// `<duration> <user mask> <host mask> [reason]`; every ban is permanent
/// for the life of this process, whatever the duration says.
fn kline(d: &mut Dispatcher, conn: ConnId, prefix: &str, params: &[String]) -> HandlerResult {
    if params.len() < 3 {
        super::need_more_params(d, conn, "KLINE");
        return Ok(());
    }

    let Some(source) = source_name(d, prefix) else {
        debug!(prefix, "KLINE from unknown source");
        return Ok(());
    };

    let reason = params
        .get(3)
        .cloned()
        .unwrap_or_else(|| "<No reason given>".to_string());

    d.add_and_apply_kline(
        KLine {
            user_mask: params[1].clone(),
            host_mask: params[2].clone(),
            reason,
        },
        &source,
    );
    Ok(())
}

/// `UNKLINE <user mask> <host mask>`.
fn unkline(d: &mut Dispatcher, conn: ConnId, prefix: &str, params: &[String]) -> HandlerResult {
    if params.len() < 2 {
        super::need_more_params(d, conn, "UNKLINE");
        return Ok(());
    }

    let Some(source) = source_name(d, prefix) else {
        debug!(prefix, "UNKLINE from unknown source");
        return Ok(());
    };

    d.remove_kline(&params[0], &params[1], &source);
    Ok(())
}

/// GCAP records a server's capability set, announced on its behalf when
/// it was introduced to the network. It must be the first and only GCAP
/// for that server, and TS6 requires QS and ENCAP in it.
fn gcap(d: &mut Dispatcher, prefix: &str, params: &[String]) -> HandlerResult {
    let Some(list) = params.first() else {
        return Err(HandlerError::violation(format!(
            "GCAP from {} with no capabs",
            prefix
        )));
    };

    let Some(server) = d.world.servers.get_mut(&Sid::new(prefix)) else {
        return Err(HandlerError::violation(format!(
            "Unknown server (GCAP): {}",
            prefix
        )));
    };

    let capabs = parse_capabs(list);
    if !capabs.contains("QS") {
        return Err(HandlerError::violation(format!(
            "{} is missing capab QS",
            server.name
        )));
    }
    if !capabs.contains("ENCAP") {
        return Err(HandlerError::violation(format!(
            "{} is missing capab ENCAP",
            server.name
        )));
    }

    if server.capabs.is_some() {
        return Err(HandlerError::violation(format!(
            "Already received GCAP from {}!",
            server.name
        )));
    }
    server.capabs = Some(capabs);
    Ok(())
}
