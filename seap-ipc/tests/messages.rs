// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::Duration;

use seap_ipc::{DescriptorId, Error, Msg, SeapContext};
use seap_sexp::SExp;

fn adopt(ctx: &SeapContext, stream: UnixStream) -> DescriptorId {
    let input = OwnedFd::from(stream.try_clone().unwrap());
    let output = OwnedFd::from(stream);
    ctx.open_fd_pair(input, output, 0).unwrap()
}

fn connected_pair() -> (SeapContext, DescriptorId, SeapContext, DescriptorId) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (a, b) = UnixStream::pair().unwrap();
    let client = SeapContext::new();
    let server = SeapContext::new();
    let sd_client = adopt(&client, a);
    let sd_server = adopt(&server, b);
    (client, sd_client, server, sd_server)
}

#[test]
fn echo_msg_over_fd_pair() {
    let (client, sd_c, server, sd_s) = connected_pair();

    let ping_id = client
        .send_sexp(sd_c, SExp::list(vec![SExp::symbol("ping")]))
        .unwrap();
    assert!(ping_id >= 1);

    let server_thread = thread::spawn(move || {
        let req = server.recv_msg(sd_s).unwrap();
        assert!(req.id() >= 1);
        assert_eq!(
            req.payload(),
            &SExp::list(vec![SExp::symbol("ping")])
        );

        let rep = Msg::new(SExp::list(vec![SExp::symbol("pong")]));
        server.reply(sd_s, rep, &req).unwrap();
    });

    let rep = client.recv_msg(sd_c).unwrap();
    assert_eq!(rep.payload(), &SExp::list(vec![SExp::symbol("pong")]));
    assert_eq!(rep.reply_id(), Some(ping_id));

    server_thread.join().unwrap();
}

#[test]
fn message_ids_increase_per_descriptor() {
    let (client, sd_c, _server, _sd_s) = connected_pair();

    let first = client.send_sexp(sd_c, SExp::uint(1)).unwrap();
    let second = client.send_sexp(sd_c, SExp::uint(2)).unwrap();
    let third = client.send_sexp(sd_c, SExp::uint(3)).unwrap();
    assert!(first < second && second < third);
}

#[test]
fn descriptor_exhaustion_is_emfile() {
    let ctx = SeapContext::builder().max_descriptors(4).build();
    let mut keep = Vec::new();
    for _ in 0..4 {
        let (a, b) = UnixStream::pair().unwrap();
        keep.push(b);
        adopt(&ctx, a);
    }

    let (a, _b) = UnixStream::pair().unwrap();
    let err = ctx
        .open_fd_pair(
            OwnedFd::from(a.try_clone().unwrap()),
            OwnedFd::from(a),
            0,
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), libc::EMFILE);
}

#[test]
fn close_then_use_is_ebadf() {
    let (client, sd_c, _server, _sd_s) = connected_pair();

    client.close(sd_c).unwrap();
    assert_eq!(
        client.send_sexp(sd_c, SExp::empty()).unwrap_err().raw_os_error(),
        libc::EBADF
    );
    assert_eq!(client.recv_msg(sd_c).unwrap_err().raw_os_error(), libc::EBADF);
    assert_eq!(client.close(sd_c).unwrap_err().raw_os_error(), libc::EBADF);
}

#[test]
fn close_unblocks_an_in_flight_recv() {
    let (client, sd_c, _server, _sd_s) = connected_pair();

    let receiver = {
        let client = client.clone();
        thread::spawn(move || client.recv_msg(sd_c))
    };

    thread::sleep(Duration::from_millis(50));
    client.close(sd_c).unwrap();

    assert!(receiver.join().unwrap().is_err());
}

#[test]
fn peer_hangup_is_an_orderly_close() {
    let (client, sd_c, server, sd_s) = connected_pair();

    server.close(sd_s).unwrap();
    assert!(matches!(client.recv_msg(sd_c), Err(Error::Closed)));
}

#[test]
fn pending_errors_are_drained_in_order() {
    let (client, sd_c, server, sd_s) = connected_pair();

    let first_id = client.send_sexp(sd_c, SExp::symbol("one")).unwrap();
    let second_id = client.send_sexp(sd_c, SExp::symbol("two")).unwrap();

    let server_thread = thread::spawn(move || {
        let one = server.recv_msg(sd_s).unwrap();
        server.reply_err(sd_s, &one, 42).unwrap();
        let two = server.recv_msg(sd_s).unwrap();
        server.reply_err(sd_s, &two, 43).unwrap();
        // A regular reply lets the client's receive loop come back up
        // with both errors parked.
        server
            .reply(sd_s, Msg::new(SExp::symbol("done")), &two)
            .unwrap();
    });

    let done = client.recv_msg(sd_c).unwrap();
    assert_eq!(done.payload(), &SExp::symbol("done"));
    server_thread.join().unwrap();

    // By-id drain picks the matching error out of the queue.
    let err = client.recv_err_by_id(sd_c, second_id).unwrap();
    assert_eq!((err.code, err.orig_id), (43, second_id));

    let err = client.recv_err(sd_c).unwrap();
    assert_eq!((err.code, err.orig_id), (42, first_id));

    assert_eq!(client.recv_err(sd_c).unwrap_err().raw_os_error(), libc::ENOENT);
    assert_eq!(
        client.recv_err_by_id(sd_c, first_id).unwrap_err().raw_os_error(),
        libc::ENOENT
    );
}

#[test]
fn connect_over_the_unix_scheme() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seap.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server_thread = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let server = SeapContext::new();
        let sd = adopt(&server, stream);

        let req = server.recv_msg(sd).unwrap();
        server
            .reply(sd, Msg::new(SExp::symbol("hi")), &req)
            .unwrap();
    });

    let client = SeapContext::new();
    let sd = client
        .connect(&format!("unix://{}", path.display()), 0)
        .unwrap();

    let id = client.send_sexp(sd, SExp::symbol("hello")).unwrap();
    let rep = client.recv_msg(sd).unwrap();
    assert_eq!(rep.payload(), &SExp::symbol("hi"));
    assert_eq!(rep.reply_id(), Some(id));

    client.close(sd).unwrap();
    server_thread.join().unwrap();
}

#[test]
fn connect_to_a_dead_socket_propagates_the_transport_errno() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nobody-home.sock");

    let client = SeapContext::new();
    let err = client
        .connect(&format!("unix://{}", path.display()), 0)
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(err.raw_os_error(), libc::ENOENT);
}
