// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn plain_text_renders() {
    let mut screen = OutputScreen::new(80, 24);
    screen.feed(b"hello world");
    assert!(screen.lines()[0].contains("hello world"));
    assert_eq!(screen.last_line(), "hello world");
}

#[test]
fn ansi_color_collapses_to_text() {
    let mut screen = OutputScreen::new(80, 24);
    screen.feed(b"\x1b[31merror:\x1b[0m boom");
    assert_eq!(screen.last_line(), "error: boom");
}

#[test]
fn carriage_return_overwrites_line() {
    let mut screen = OutputScreen::new(80, 24);
    screen.feed(b"progress 10%\rprogress 99%");
    assert_eq!(screen.last_line(), "progress 99%");
}

#[test]
fn summary_takes_trailing_non_empty_lines() {
    let mut screen = OutputScreen::new(80, 24);
    screen.feed(b"one\r\n\r\ntwo\r\nthree\r\n");
    assert_eq!(screen.summary(2), "two\nthree");
    assert_eq!(screen.summary(10), "one\ntwo\nthree");
    assert_eq!(screen.summary(0), "");
}

#[test]
fn split_utf8_across_feeds() {
    let mut screen = OutputScreen::new(80, 24);
    let bytes = "héllo".as_bytes();
    // Split inside the two-byte é sequence.
    screen.feed(&bytes[..2]);
    screen.feed(&bytes[2..]);
    assert_eq!(screen.last_line(), "héllo");
}

#[test]
fn blank_screen_has_empty_summary() {
    let screen = OutputScreen::new(80, 24);
    assert_eq!(screen.last_line(), "");
    assert_eq!(screen.summary(3), "");
}

#[test]
fn resize_keeps_feeding() {
    let mut screen = OutputScreen::new(80, 24);
    screen.feed(b"before");
    screen.resize(120, 40);
    screen.feed(b"\r\nafter");
    assert_eq!(screen.last_line(), "after");
}
