//! Replica-set commands

use super::CommandRequest;
use crate::database::Database;
use rook_core::{Document, Error, OperationContext, Result, Timestamp, Value};
use rook_repl::{
    HeartbeatRequest, MemberConfig, MemberState, OpTime, ReplSetConfig, SignedClusterTime,
};

pub(super) fn repl_set_initiate(
    db: &Database,
    request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    let Some(Value::Document(spec)) = request.body.get("replSetInitiate") else {
        return Err(Error::bad_value("replSetInitiate requires a config document"));
    };
    let Some(Value::String(name)) = spec.get("_id") else {
        return Err(Error::bad_value("replica set config requires _id"));
    };
    let Some(Value::Array(member_specs)) = spec.get("members") else {
        return Err(Error::bad_value("replica set config requires members"));
    };
    let mut members = Vec::with_capacity(member_specs.len());
    for m in member_specs {
        let Value::Document(m) = m else {
            return Err(Error::bad_value("members must be documents"));
        };
        let id = match m.get("_id") {
            Some(Value::Int32(n)) => *n as u32,
            Some(Value::Int64(n)) => *n as u32,
            _ => return Err(Error::bad_value("member requires numeric _id")),
        };
        let Some(Value::String(host)) = m.get("host") else {
            return Err(Error::bad_value("member requires host"));
        };
        let mut member = MemberConfig::new(id, host.clone());
        if let Some(Value::Int32(votes)) = m.get("votes") {
            member.votes = *votes as u32;
        }
        if let Some(Value::Double(priority)) = m.get("priority") {
            member.priority = *priority;
        }
        if let Some(Value::Boolean(true)) = m.get("arbiterOnly") {
            member.arbiter_only = true;
        }
        members.push(member);
    }
    db.repl_set_initiate(ReplSetConfig::new(name.clone(), members)?)?;
    Ok(Document::new())
}

pub(super) fn repl_set_get_status(
    db: &Database,
    _request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    db.repl().status()
}

pub(super) fn repl_set_heartbeat(
    db: &Database,
    request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    let heartbeat = heartbeat_from_doc(&request.body)?;
    let response = db.repl().process_heartbeat(&heartbeat)?;
    let mut out = Document::new();
    out.push("responderId", Value::Int64(response.responder_id as i64));
    out.push("state", Value::Int32(response.state.code()));
    out.push("stateStr", response.state.as_str());
    out.push("term", Value::Int64(response.term as i64));
    out.push(
        "lastApplied",
        optime_to_doc(&response.last_applied),
    );
    out.push("configVersion", Value::Int64(response.config_version as i64));
    out.push("clusterTime", signed_time_to_doc(&response.cluster_time));
    Ok(out)
}

fn optime_to_doc(optime: &OpTime) -> Value {
    let mut d = Document::new();
    d.push("ts", Value::Timestamp(optime.timestamp));
    d.push("t", Value::Int64(optime.term as i64));
    Value::Document(d)
}

fn optime_from_doc(v: Option<&Value>) -> Result<OpTime> {
    let Some(Value::Document(d)) = v else {
        return Err(Error::bad_value("expected optime document"));
    };
    let Some(Value::Timestamp(ts)) = d.get("ts") else {
        return Err(Error::bad_value("optime requires ts"));
    };
    let term = match d.get("t") {
        Some(Value::Int64(t)) => *t as u64,
        Some(Value::Int32(t)) => *t as u64,
        _ => 0,
    };
    Ok(OpTime::new(*ts, term))
}

fn signed_time_to_doc(signed: &SignedClusterTime) -> Value {
    let mut d = Document::new();
    d.push("clusterTime", Value::Timestamp(signed.time));
    d.push("keyId", Value::Int64(signed.key_id as i64));
    d.push("signature", Value::Binary(signed.signature.clone()));
    Value::Document(d)
}

fn signed_time_from_doc(v: Option<&Value>) -> Result<SignedClusterTime> {
    let Some(Value::Document(d)) = v else {
        return Err(Error::bad_value("expected $clusterTime document"));
    };
    let Some(Value::Timestamp(time)) = d.get("clusterTime") else {
        return Err(Error::bad_value("$clusterTime requires clusterTime"));
    };
    let key_id = match d.get("keyId") {
        Some(Value::Int64(k)) => *k as u64,
        _ => 0,
    };
    let signature = match d.get("signature") {
        Some(Value::Binary(b)) => b.clone(),
        _ => Vec::new(),
    };
    Ok(SignedClusterTime {
        time: *time,
        key_id,
        signature,
    })
}

fn state_from_code(code: i32) -> MemberState {
    match code {
        1 => MemberState::Primary,
        2 => MemberState::Secondary,
        3 => MemberState::Recovering,
        5 => MemberState::Startup2,
        7 => MemberState::Arbiter,
        8 => MemberState::Down,
        9 => MemberState::Rollback,
        10 => MemberState::Removed,
        4 => MemberState::Fatal,
        _ => MemberState::Startup,
    }
}

fn heartbeat_from_doc(body: &Document) -> Result<HeartbeatRequest> {
    let Some(Value::String(set_name)) = body.get("replSetHeartbeat") else {
        return Err(Error::bad_value("replSetHeartbeat requires the set name"));
    };
    let sender_id = match body.get("senderId") {
        Some(Value::Int32(n)) => *n as u32,
        Some(Value::Int64(n)) => *n as u32,
        _ => return Err(Error::bad_value("heartbeat requires senderId")),
    };
    let sender_state = match body.get("senderState") {
        Some(Value::Int32(code)) => state_from_code(*code),
        _ => MemberState::Startup,
    };
    let sender_term = match body.get("term") {
        Some(Value::Int64(t)) => *t as u64,
        Some(Value::Int32(t)) => *t as u64,
        _ => 0,
    };
    let config_version = match body.get("configVersion") {
        Some(Value::Int64(v)) => *v as u64,
        Some(Value::Int32(v)) => *v as u64,
        _ => 0,
    };
    let cluster_time = signed_time_from_doc(body.get("clusterTime")).unwrap_or(SignedClusterTime {
        time: Timestamp::new(0, 0),
        key_id: 0,
        signature: Vec::new(),
    });
    Ok(HeartbeatRequest {
        set_name: set_name.clone(),
        sender_id,
        sender_state,
        sender_term,
        last_applied: optime_from_doc(body.get("lastApplied")).unwrap_or_default(),
        config_version,
        cluster_time,
    })
}

/// Serialize a heartbeat into the command body another node dispatches.
pub fn heartbeat_to_doc(heartbeat: &HeartbeatRequest) -> Document {
    let mut d = Document::new();
    d.push("replSetHeartbeat", heartbeat.set_name.clone());
    d.push("senderId", Value::Int64(heartbeat.sender_id as i64));
    d.push("senderState", Value::Int32(heartbeat.sender_state.code()));
    d.push("term", Value::Int64(heartbeat.sender_term as i64));
    d.push("lastApplied", optime_to_doc(&heartbeat.last_applied));
    d.push(
        "configVersion",
        Value::Int64(heartbeat.config_version as i64),
    );
    d.push("clusterTime", signed_time_to_doc(&heartbeat.cluster_time));
    d
}
