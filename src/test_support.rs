//! Message builders shared by the unit tests.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

pub fn query_message(id: u16, qname: &str) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(
        Name::from_str(qname).expect("name"),
        RecordType::A,
    ));
    msg
}

pub fn query_bytes(id: u16, qname: &str) -> Vec<u8> {
    query_message(id, qname).to_bytes().expect("encode query")
}

fn response_message(id: u16, qname: &str) -> Message {
    let mut msg = query_message(id, qname);
    msg.set_message_type(MessageType::Response);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    msg
}

pub fn a_response(id: u16, qname: &str, ips: &[Ipv4Addr]) -> Vec<u8> {
    let mut msg = response_message(id, qname);
    let name = Name::from_str(qname).expect("name");
    for ip in ips {
        msg.add_answer(Record::from_rdata(name.clone(), 300, RData::A(A(*ip))));
    }
    msg.to_bytes().expect("encode response")
}

pub fn aaaa_then_a_response(id: u16, qname: &str, v6: Ipv6Addr, v4: Ipv4Addr) -> Vec<u8> {
    let mut msg = response_message(id, qname);
    let name = Name::from_str(qname).expect("name");
    msg.add_answer(Record::from_rdata(name.clone(), 300, RData::AAAA(AAAA(v6))));
    msg.add_answer(Record::from_rdata(name, 300, RData::A(A(v4))));
    msg.to_bytes().expect("encode response")
}

pub fn empty_response(id: u16, qname: &str) -> Vec<u8> {
    response_message(id, qname)
        .to_bytes()
        .expect("encode response")
}
