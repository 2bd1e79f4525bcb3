use core::convert::TryFrom;
use core::str;

use derive_more::Display;
use nom::{
    branch::alt,
    bytes::complete::{tag, take, take_while_m_n},
    combinator::{all_consuming, cond, map, map_opt, map_res, recognize, rest, verify},
    error::{context, ErrorKind, ParseError, VerboseError},
    multi::{length_data, many1},
    number::complete::{be_u16, be_u8},
    sequence::{pair, tuple},
    IResult,
};

use crate::packet::*;

impl FixedHeader {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(
            tuple((
                map_res(
                    be_u8,
                    |b| -> Result<_, num_enum::TryFromPrimitiveError<Type>> {
                        let packet_type = Type::try_from((b >> 4) & 0x0F)?;
                        let packet_flags = b & 0x0F;

                        Ok((packet_type, packet_flags))
                    },
                ),
                varint,
            )),
            |((packet_type, packet_flags), remaining_length)| FixedHeader {
                packet_type,
                packet_flags,
                remaining_length,
            },
        )(input)
    }
}

const CONTINUATION_BIT: u8 = 0x80;

fn varint<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], usize, E> {
    context(
        "variable length",
        map(
            verify(
                recognize(pair(
                    take_while_m_n(0, 3, |b| (b & CONTINUATION_BIT) != 0),
                    verify(be_u8, |b| (b & CONTINUATION_BIT) == 0),
                )),
                |s: &[u8]| s.len() <= 4,
            ),
            |s: &[u8]| {
                s.iter().enumerate().fold(0, |value, (i, b)| {
                    value + (usize::from(*b & !CONTINUATION_BIT) << (7 * i))
                })
            },
        ),
    )(input)
}

/// Binary Data is represented by a Two Byte Integer length which indicates the number of data bytes,
/// followed by that number of bytes. Thus, the length of Binary Data is limited to the range of 0 to 65,535 Bytes.
fn binary_data<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a [u8], E> {
    context("binary data", length_data(be_u16))(input)
}

/// Text fields in the Control Packets described later are encoded as UTF-8 strings.
fn utf8_str<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("utf8 string", map_res(length_data(be_u16), str::from_utf8))(input)
}

/// The Topic Name identifies the information channel to which payload data is published.
///
/// Topic Names in a PUBLISH Packet MUST NOT contain the `+` or `#` wildcard characters.
fn topic_name<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "topic name",
        verify(utf8_str, |s: &str| {
            s.bytes().all(|c| c != b'#' && c != b'+')
        }),
    )(input)
}

/// An expression contained in a Subscription, to indicate an interest in one or more topics.
///
/// A Topic Filter can include wildcard characters.
fn topic_filter<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("topic filter", utf8_str)(input)
}

fn packet_id<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], PacketId, E> {
    context("packet id", be_u16)(input)
}

fn qos<'a, E: ParseError<&'a [u8]>>(input: &'a [u8], bits: u8) -> Result<QoS, nom::Err<E>> {
    QoS::try_from(bits).map_err(|_| nom::Err::Error(E::from_error_kind(input, ErrorKind::Verify)))
}

/// Reject a fixed header whose flag nibble differs from the value the protocol
/// mandates for this packet type.
fn reserved_flags<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
    flags: u8,
    expected: u8,
) -> Result<(), nom::Err<E>> {
    if flags == expected {
        Ok(())
    } else {
        Err(nom::Err::Error(E::from_error_kind(
            input,
            ErrorKind::Verify,
        )))
    }
}

/// Parses the bytes slice into Packet type.
pub fn parse<'a>(input: &'a [u8]) -> IResult<&'a [u8], Packet<'a>, VerboseError<&'a [u8]>> {
    let (input, fixed_header) = FixedHeader::parse(input)?;
    let (input, remaining) = take(fixed_header.remaining_length)(input)?;
    let flags = fixed_header.packet_flags;

    match fixed_header.packet_type {
        Type::CONNECT => {
            reserved_flags(remaining, flags, 0)?;
            context("Connect", all_consuming(map(connect, Packet::Connect)))(remaining)
        }
        Type::CONNACK => {
            reserved_flags(remaining, flags, 0)?;
            context(
                "ConnectAck",
                all_consuming(map(connect_ack, Packet::ConnectAck)),
            )(remaining)
        }
        Type::PUBLISH => context(
            "Publish",
            all_consuming(map(move |input| publish(input, flags), Packet::Publish)),
        )(remaining),
        Type::PUBACK => {
            reserved_flags(remaining, flags, 0)?;
            context(
                "PublishAck",
                all_consuming(map(packet_id, |packet_id| {
                    Packet::PublishAck(PublishAck { packet_id })
                })),
            )(remaining)
        }
        Type::PUBREC => {
            reserved_flags(remaining, flags, 0)?;
            context(
                "PublishReceived",
                all_consuming(map(packet_id, |packet_id| {
                    Packet::PublishReceived(PublishReceived { packet_id })
                })),
            )(remaining)
        }
        Type::PUBREL => {
            reserved_flags(remaining, flags, 0x02)?;
            context(
                "PublishRelease",
                all_consuming(map(packet_id, |packet_id| {
                    Packet::PublishRelease(PublishRelease { packet_id })
                })),
            )(remaining)
        }
        Type::PUBCOMP => {
            reserved_flags(remaining, flags, 0)?;
            context(
                "PublishComplete",
                all_consuming(map(packet_id, |packet_id| {
                    Packet::PublishComplete(PublishComplete { packet_id })
                })),
            )(remaining)
        }
        Type::SUBSCRIBE => {
            reserved_flags(remaining, flags, 0x02)?;
            context("Subscribe", all_consuming(map(subscribe, Packet::Subscribe)))(remaining)
        }
        Type::SUBACK => {
            reserved_flags(remaining, flags, 0)?;
            context(
                "SubscribeAck",
                all_consuming(map(subscribe_ack, Packet::SubscribeAck)),
            )(remaining)
        }
        Type::UNSUBSCRIBE => {
            reserved_flags(remaining, flags, 0x02)?;
            context(
                "Unsubscribe",
                all_consuming(map(unsubscribe, Packet::Unsubscribe)),
            )(remaining)
        }
        Type::UNSUBACK => {
            reserved_flags(remaining, flags, 0)?;
            context(
                "UnsubscribeAck",
                all_consuming(map(packet_id, |packet_id| {
                    Packet::UnsubscribeAck(UnsubscribeAck { packet_id })
                })),
            )(remaining)
        }
        Type::PINGREQ => {
            reserved_flags(remaining, flags, 0)?;
            context("Ping", map(all_consuming(rest), |_| Packet::Ping))(remaining)
        }
        Type::PINGRESP => {
            reserved_flags(remaining, flags, 0)?;
            context("Pong", map(all_consuming(rest), |_| Packet::Pong))(remaining)
        }
        Type::DISCONNECT => {
            reserved_flags(remaining, flags, 0)?;
            context("Disconnect", map(all_consuming(rest), |_| Packet::Disconnect))(remaining)
        }
    }
    .map(|(_, packet)| (input, packet))
}

fn connect<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Connect<'a>, E> {
    let (input, (protocol_version, flags, keep_alive)) = tuple((
        context(
            "protocol name",
            alt((
                map(tag(PROTOCOL_V311), |_| ProtocolVersion::V311),
                map(tag(PROTOCOL_V31), |_| ProtocolVersion::V31),
            )),
        ),
        context("flags", map_opt(be_u8, ConnectFlags::from_bits)),
        context("keepalive", be_u16),
    ))(input)?;

    let will_qos = qos(input, (flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?;

    let (input, (client_id, last_will, username, password)) = tuple((
        context("client id", utf8_str),
        cond(
            flags.contains(ConnectFlags::LAST_WILL),
            context(
                "will",
                map(
                    tuple((
                        context("will topic", utf8_str),
                        context("will message", binary_data),
                    )),
                    move |(topic_name, message)| LastWill {
                        qos: will_qos,
                        retain: flags.contains(ConnectFlags::WILL_RETAIN),
                        topic_name,
                        message,
                    },
                ),
            ),
        ),
        cond(
            flags.contains(ConnectFlags::USERNAME),
            context("username", utf8_str),
        ),
        cond(
            flags.contains(ConnectFlags::PASSWORD),
            context("password", binary_data),
        ),
    ))(input)?;

    Ok((
        input,
        Connect {
            protocol_version,
            clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            client_id,
            last_will,
            username,
            password,
        },
    ))
}

fn connect_ack<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], ConnectAck, E> {
    map(
        tuple((
            context("flags", map_opt(be_u8, ConnectAckFlags::from_bits)),
            context("return code", map_res(be_u8, ConnectReturnCode::try_from)),
        )),
        |(flags, return_code)| ConnectAck {
            session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
            return_code,
        },
    )(input)
}

fn publish<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
    flags: u8,
) -> IResult<&'a [u8], Publish<'a>, E> {
    let flags = PublishFlags::from_bits_truncate(flags);
    let dup = flags.contains(PublishFlags::DUP);
    let retain = flags.contains(PublishFlags::RETAIN);
    let qos = qos(input, (flags & PublishFlags::QOS).bits() >> PUBLISH_QOS_SHIFT)?;

    let (input, (topic_name, packet_id, payload)) = tuple((
        topic_name,
        cond(qos > QoS::AtMostOnce, packet_id),
        rest,
    ))(input)?;

    Ok((
        input,
        Publish {
            dup,
            qos,
            retain,
            topic_name,
            packet_id,
            payload,
        },
    ))
}

fn subscribe<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Subscribe<'a>, E> {
    map(
        tuple((
            packet_id,
            many1(context(
                "subscription",
                pair(topic_filter, map_res(be_u8, QoS::try_from)),
            )),
        )),
        |(packet_id, subscriptions)| Subscribe {
            packet_id,
            subscriptions,
        },
    )(input)
}

fn subscribe_ack<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], SubscribeAck, E> {
    map(
        tuple((
            packet_id,
            many1(context(
                "return code",
                map_res(be_u8, |b| {
                    if b == SubscribeReturnCode::FAILURE {
                        Ok(SubscribeReturnCode::Failure)
                    } else {
                        QoS::try_from(b).map(SubscribeReturnCode::Success)
                    }
                }),
            )),
        )),
        |(packet_id, status)| SubscribeAck { packet_id, status },
    )(input)
}

fn unsubscribe<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], Unsubscribe<'a>, E> {
    map(
        tuple((packet_id, many1(topic_filter))),
        |(packet_id, topic_filters)| Unsubscribe {
            packet_id,
            topic_filters,
        },
    )(input)
}

/// Why a persisted blob was rejected by [`restore`].
#[derive(Debug, PartialEq, Clone, Copy, Display)]
pub enum RestoreError {
    /// The remaining-length field is malformed (continuation past four bytes).
    #[display(fmt = "malformed remaining length")]
    BadLength,
    /// The buffer length does not equal the length announced by the fixed header.
    #[display(fmt = "buffer length does not match fixed header")]
    LengthMismatch,
    /// The packet body failed to parse.
    #[display(fmt = "malformed packet body")]
    BadPacket,
}

impl std::error::Error for RestoreError {}

/// Total on-wire length of the packet whose fixed header starts `input`.
///
/// Returns `Ok(None)` while more bytes are needed to finish the remaining-length
/// field, and [`RestoreError::BadLength`] when that field is malformed.
pub fn frame_length(input: &[u8]) -> Result<Option<usize>, RestoreError> {
    if input.len() < 2 {
        return Ok(None);
    }

    let mut remaining = 0usize;
    for (i, b) in input[1..].iter().enumerate() {
        if i >= 4 {
            return Err(RestoreError::BadLength);
        }
        remaining += usize::from(b & !CONTINUATION_BIT) << (7 * i);
        if b & CONTINUATION_BIT == 0 {
            return Ok(Some(1 + i + 1 + remaining));
        }
    }

    Ok(None)
}

/// Rebuilds a packet from a persisted blob.
///
/// The blob must hold exactly one packet: the announced length has to match the
/// buffer length, otherwise the record is reported bad so the caller can discard
/// the key it came from.
pub fn restore(input: &[u8]) -> Result<Packet, RestoreError> {
    match frame_length(input)? {
        Some(total) if total == input.len() => parse(input)
            .map(|(_, packet)| packet)
            .map_err(|_| RestoreError::BadPacket),
        _ => Err(RestoreError::LengthMismatch),
    }
}
